use webhook_fanout::{compute_signature, verify_webhook_request};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let secret = b"supersecret";
    let body = br#"{"analysis_id":"an-123","score":82}"#;

    // What the sender would attach.
    let signature = compute_signature(secret, body).map_err(|err| err.to_string())?;
    let headers = vec![
        ("X-Webhook-Signature", signature.as_str()),
        ("X-Webhook-Event", "analysis.completed"),
        ("X-Webhook-Delivery", "4f1c2d7e-0000-4000-8000-000000000000"),
    ];

    match verify_webhook_request(headers.iter().map(|(k, v)| (*k, *v)), body, secret, "X-Webhook-Signature") {
        Ok(()) => println!("signature ok"),
        Err(err) => println!("rejected: {err:?}"),
    }
    Ok(())
}
