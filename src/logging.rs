use tracing_subscriber::EnvFilter;

/// Default filter directive for a daemon debug level. `RUST_LOG` wins when set.
pub fn default_directive(debug: u8) -> &'static str {
    match debug {
        0 => "info,tower_http=warn",
        1 => "debug,tower_http=info",
        _ => "trace",
    }
}

pub fn init(debug: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    // Ignore the error if a subscriber is already installed (tests, embedding).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_get_more_verbose() {
        assert!(default_directive(0).starts_with("info"));
        assert!(default_directive(1).starts_with("debug"));
        assert_eq!(default_directive(2), "trace");
    }
}
