use std::io::Write;

use serde_json::json;

use crate::identity::Identity;

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

pub fn exit_error(message: &str, docs_hint: Option<&str>) -> ! {
    let mut err = json!({
        "error": "cli_error",
        "message": message
    });
    if let Some(hint) = docs_hint {
        err["docs_hint"] = json!(hint);
    }
    eprintln!("{}", serde_json::to_string_pretty(&err).unwrap_or_else(|_| message.to_string()));
    std::process::exit(1);
}

pub fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(out) => println!("{out}"),
        Err(_) => println!("{value}"),
    }
}

pub fn identity_json(identity: &Identity) -> serde_json::Value {
    json!({
        "uid": identity.uid,
        "email": identity.email,
        "display_name": identity.display_name,
        "photo_url": identity.photo_url,
    })
}

/// Prompt on stderr and read one line from stdin (used when no password flag is given).
pub fn read_secret(prompt: &str) -> std::io::Result<String> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
