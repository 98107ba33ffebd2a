use serde_json::json;

use crate::gate::AuthGate;
use crate::guard::Navigation;
use crate::util::{identity_json, print_json, read_secret};

fn resolve_password(password: Option<String>) -> Result<String, Box<dyn std::error::Error>> {
    match password {
        Some(p) => Ok(p),
        None => Ok(read_secret("Password: ")?),
    }
}

pub async fn register(
    gate: &AuthGate,
    email: &str,
    password: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let password = resolve_password(password)?;
    let identity = gate.register(email, &password).await?;
    print_json(&json!({
        "status": "registered",
        "identity": identity_json(&identity)
    }));
    Ok(())
}

pub async fn login(
    gate: &AuthGate,
    email: Option<&str>,
    password: Option<String>,
    federated: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let identity = if federated {
        gate.login_with_federated_popup().await?
    } else {
        let email = email.ok_or("--email is required unless --federated is used")?;
        let password = resolve_password(password)?;
        gate.login_with_credential(email, &password).await?
    };
    print_json(&json!({
        "status": "authenticated",
        "identity": identity_json(&identity)
    }));
    Ok(())
}

pub async fn logout(gate: &AuthGate) -> Result<(), Box<dyn std::error::Error>> {
    let redirect = match gate.sign_out().await {
        Navigation::Redirect(to) => Some(to),
        Navigation::Admit => None,
    };
    print_json(&json!({
        "status": "signed_out",
        "redirect": redirect
    }));
    Ok(())
}

pub fn whoami(gate: &AuthGate) -> Result<(), Box<dyn std::error::Error>> {
    let output = match gate.current_identity() {
        Some(identity) => json!({
            "authenticated": true,
            "identity": identity_json(&identity)
        }),
        None => json!({ "authenticated": false }),
    };
    print_json(&output);
    Ok(())
}

pub async fn token(gate: &AuthGate, force_refresh: bool) -> Result<(), Box<dyn std::error::Error>> {
    let token = gate.current_token(force_refresh).await?;
    print_json(&json!({ "token": token }));
    Ok(())
}
