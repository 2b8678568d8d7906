use once_cell::sync::OnceCell;
use std::env;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber once. `RUST_LOG` filters (default `info`);
/// `QUERYGATE_LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let json = env::var("QUERYGATE_LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if json {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_current_span(false)
                .init();
        } else {
            fmt().with_env_filter(filter).with_target(false).init();
        }
    });
}
