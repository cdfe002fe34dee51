use std::time::Duration;

use flagship::{ClientConfig, FlusherThreadConfig, User};

pub fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("flagship=debug"))
        .init();

    let sdk_key = std::env::var("FLAGSHIP_SDK_KEY").unwrap();
    let client = ClientConfig::from_sdk_key(sdk_key)
        .flag_cache_ttl(Duration::from_secs(30))
        .private_attribute("email")
        .to_client()
        .unwrap();

    // Start a thread that publishes queued events every few seconds.
    let flusher = client
        .start_flusher_thread(FlusherThreadConfig::default())
        .unwrap();

    let user = User::builder("test-user")
        .email("test-user@example.com")
        .country("NZ")
        .custom("plan", "pro")
        .build();

    // Returns the default (false) if the flag is missing or cannot be evaluated.
    let enabled = client.bool_variation("a-boolean-flag", &user, false);
    println!("Assignment: {:?}", enabled);

    let detail = client.variation_detail("a-boolean-flag", &user, false.into());
    println!("Reason: {:?}", detail.reason);

    client.track("demo-finished", &user, None);

    // Publish anything left in the queue before exiting.
    match flusher {
        Some(flusher) => flusher.shutdown().unwrap(),
        None => {
            client.flush();
        }
    }
}
