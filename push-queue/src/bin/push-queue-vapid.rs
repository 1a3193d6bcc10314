use base64::Engine as _;
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::OsRng;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let json = args.iter().any(|a| a == "--json");

    let signing_key = SigningKey::random(&mut OsRng);
    let public_key_raw = signing_key.verifying_key().to_encoded_point(false);

    let public_b64 =
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(public_key_raw.as_bytes());
    let private_b64 =
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(signing_key.to_bytes());

    if json {
        let keys = serde_json::json!({
            "public_key": public_b64,
            "private_key": private_b64,
        });
        println!("{}", serde_json::to_string(&keys)?);
    } else {
        println!("WEB_PUSH_VAPID_PUBLIC_KEY={}", public_b64);
        println!("WEB_PUSH_VAPID_PRIVATE_KEY={}", private_b64);
    }

    Ok(())
}

fn print_help() {
    println!("push-queue-vapid - Generate a VAPID key pair for the push-queue worker");
    println!();
    println!("Usage:");
    println!("  push-queue-vapid           # prints .env lines");
    println!("  push-queue-vapid --json    # prints JSON");
    println!();
    println!("Also set WEB_PUSH_VAPID_SUBJECT (default mailto:admin@localhost).");
}
