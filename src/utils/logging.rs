use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_DIRECTIVE: &str = "wasm_build_sync=info,tower_http=info";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default filter; `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = fmt().with_env_filter(filter).with_target(true);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };

    // Tests and embedders may have installed a subscriber already
    if let Err(e) = result {
        tracing::debug!("tracing subscriber already installed: {}", e);
    }
}
