//! stratumctl - diagnostic CLI against a running node.
//!
//! Usage:
//!   stratumctl <addr> resolve <uuid>
//!   stratumctl <addr> lease <uuid>
//!   stratumctl <addr> delete <uuid>
//!   stratumctl <addr> stats
//!
//! Exit codes: 0 success, 1 usage error, 2 request error.

use std::process::ExitCode;

use stratum::core::PayloadId;

fn usage() {
    eprintln!("Usage:");
    eprintln!("  stratumctl <addr> resolve <uuid>");
    eprintln!("  stratumctl <addr> lease <uuid>");
    eprintln!("  stratumctl <addr> delete <uuid>");
    eprintln!("  stratumctl <addr> stats");
}

fn parse_uuid(text: &str) -> Option<PayloadId> {
    match PayloadId::parse(text) {
        Ok(id) => Some(id),
        Err(e) => {
            eprintln!("{}", e);
            None
        }
    }
}

async fn run() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        usage();
        return ExitCode::from(1);
    }

    let addr = args[0].trim_end_matches('/');
    let base = if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    };
    let command = args[1].as_str();
    let client = reqwest::Client::new();

    let outcome: anyhow::Result<String> = match command {
        "resolve" => {
            let Some(arg) = args.get(2) else {
                usage();
                return ExitCode::from(1);
            };
            let Some(id) = parse_uuid(arg) else {
                return ExitCode::from(1);
            };
            fetch_json(
                client.get(format!("{}/v1/data/resolve/{}", base, id)),
            )
            .await
            .map(|body| {
                format!(
                    "tier={} state={} version={} size={}",
                    body["tier"].as_str().unwrap_or("?"),
                    body["state"].as_str().unwrap_or("?"),
                    body["version"],
                    body["size_bytes"]
                )
            })
        }
        "lease" => {
            let Some(arg) = args.get(2) else {
                usage();
                return ExitCode::from(1);
            };
            let Some(id) = parse_uuid(arg) else {
                return ExitCode::from(1);
            };
            let request = serde_json::json!({
                "id": id,
                "min_lease_duration_ms": 5000,
            });
            fetch_json(client.post(format!("{}/v1/data/lease", base)).json(&request))
                .await
                .map(|body| {
                    format!(
                        "lease={} expires_at_ms={}",
                        body["lease_id"].as_str().unwrap_or("?"),
                        body["expires_at_ms"]
                    )
                })
        }
        "delete" => {
            let Some(arg) = args.get(2) else {
                usage();
                return ExitCode::from(1);
            };
            let Some(id) = parse_uuid(arg) else {
                return ExitCode::from(1);
            };
            fetch_json(client.delete(format!("{}/v1/catalog/payloads/{}", base, id)))
                .await
                .map(|_| "deleted".to_string())
        }
        "stats" => fetch_json(client.get(format!("{}/v1/admin/stats", base)))
            .await
            .map(|body| {
                format!(
                    "ram={} disk={} gpu={}\nbytes_ram={} bytes_disk={} bytes_gpu={}",
                    body["payloads_ram"],
                    body["payloads_disk"],
                    body["payloads_gpu"],
                    body["bytes_ram"],
                    body["bytes_disk"],
                    body["bytes_gpu"]
                )
            }),
        _ => {
            usage();
            return ExitCode::from(1);
        }
    };

    match outcome {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(2)
        }
    }
}

async fn fetch_json(request: reqwest::RequestBuilder) -> anyhow::Result<serde_json::Value> {
    let response = request.send().await?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
    if !status.is_success() {
        let message = body["message"].as_str().unwrap_or("request failed");
        anyhow::bail!("{} ({})", message, status);
    }
    Ok(body)
}

#[tokio::main]
async fn main() -> ExitCode {
    run().await
}
