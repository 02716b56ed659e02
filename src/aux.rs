use std::{io::IsTerminal, sync::OnceLock};

use rayon::ThreadPool;
use tracing::{info, warn};
use tracing_subscriber::{filter::Directive, prelude::*, EnvFilter};

/// decode pool, built on first use; `None` when it could not be built
static DECODE_POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();

/// How the stdout log layer is set up. `RUST_LOG` still overrides the
/// directive.
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub directive: Directive,
    pub show_target: bool,
    pub ansi: bool,
}

impl LogSettings {
    /// Colours only when stdout is a terminal.
    pub fn new(directive: Directive) -> Self {
        Self {
            directive,
            show_target: true,
            ansi: std::io::stdout().is_terminal(),
        }
    }

    pub fn with_target(mut self, show: bool) -> Self {
        self.show_target = show;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(self.directive.clone())
            .from_env_lossy()
    }

    /// Installs the global subscriber. A second call keeps the first one.
    pub fn install(&self) {
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(self.ansi)
            .with_target(self.show_target)
            .with_filter(self.filter());

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            warn!(target: "vault_ingest", "log subscriber already installed");
        }
    }
}

/// Sets up logging and warms the decode pool.
pub fn init_all(settings: &LogSettings) {
    settings.install();
    if let Some(pool) = decode_pool() {
        info!(target: "vault_ingest", threads = pool.current_num_threads(), "decode pool ready");
    }
}

fn decode_pool() -> Option<&'static ThreadPool> {
    DECODE_POOL
        .get_or_init(|| {
            rayon::ThreadPoolBuilder::new()
                .thread_name(|i| format!("vault-decode-{i}"))
                .build()
                .map_err(|e| warn!(target: "vault_ingest", "no decode pool, decoding inline - {e}"))
                .ok()
        })
        .as_ref()
}

/// Runs `op` on the decode pool, or inline if the pool could not be built.
/// Blocks the caller until `op` is done.
pub fn execute_on_threadpool<OP, R>(op: OP) -> R
where
    OP: FnOnce() -> R + Send,
    R: Send,
{
    match decode_pool() {
        Some(pool) => pool.install(op),
        None => op(),
    }
}

#[cfg(test)]
mod tests {
    use rayon::prelude::*;

    use super::*;

    #[test]
    fn test_work_runs_on_decode_pool() {
        let names: Vec<Option<String>> = execute_on_threadpool(|| {
            (0..8)
                .into_par_iter()
                .map(|_| std::thread::current().name().map(str::to_owned))
                .collect()
        });
        if decode_pool().is_some() {
            assert!(names
                .iter()
                .all(|n| n.as_deref().is_some_and(|n| n.starts_with("vault-decode-"))));
        }
    }

    #[test]
    fn test_settings_keep_directive() {
        let settings = LogSettings::new("vault_ingest=debug".parse().unwrap()).with_target(false);
        assert!(!settings.show_target);
        assert_eq!(settings.directive.to_string().to_lowercase(), "vault_ingest=debug");
    }
}
