use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::chat::{ChatClient, ChatError, ChatOutcome};
use crate::gate::AuthGate;
use crate::guard::{Navigation, Navigator};
use crate::util::print_json;

pub async fn run(
    gate: &AuthGate,
    navigator: &Navigator,
    client: &ChatClient,
    message: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    match message {
        Some(message) => {
            let outcome = exchange(gate, client, &message).await?;
            print_json(&outcome_json(&outcome));
            Ok(())
        }
        None => interactive(gate, navigator, client).await,
    }
}

async fn exchange(
    gate: &AuthGate,
    client: &ChatClient,
    message: &str,
) -> Result<ChatOutcome, Box<dyn std::error::Error>> {
    let token = gate.current_token(false).await?;
    match client.send(&token, message).await {
        Err(ChatError::Unauthorized(reason)) => Err(format!(
            "{reason}. Your session may have expired; run `motorchat login` again."
        )
        .into()),
        other => Ok(other?),
    }
}

fn outcome_json(outcome: &ChatOutcome) -> serde_json::Value {
    match outcome {
        ChatOutcome::Reply(reply) => json!({
            "message": reply.message,
            "remainingRequests": reply.remaining_requests,
            "resetTime": reply.reset_time,
        }),
        ChatOutcome::QuotaExceeded(quota) => json!({
            "error": quota.error,
            "resetTime": quota.reset_time,
        }),
    }
}

async fn interactive(
    gate: &AuthGate,
    navigator: &Navigator,
    client: &ChatClient,
) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("Ask about your car. /logout signs out, /quit exits.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/logout" => {
                if let Navigation::Redirect(to) = gate.sign_out().await {
                    let landed = navigator.navigate(&to).await?;
                    print_json(&json!({ "status": "signed_out", "redirect": landed }));
                }
                break;
            }
            message => match exchange(gate, client, message).await? {
                ChatOutcome::Reply(reply) => {
                    println!("{}", reply.message);
                    eprintln!(
                        "({} requests left, window resets {})",
                        reply.remaining_requests, reply.reset_time
                    );
                }
                ChatOutcome::QuotaExceeded(quota) => {
                    eprintln!("{}", quota.error);
                }
            },
        }
    }
    Ok(())
}
