//! Tracing setup and the runtime verbosity switch.
//!
//! The binary installs a `tracing-subscriber` registry whose filter sits
//! behind a reload layer. The resulting [`ReloadSwitch`] is handed to the
//! control channel so `debug on|off` can change verbosity without restarting.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::error::{Error, Result};

/// Filter used while verbose tracing is on.
pub const VERBOSE_FILTER: &str = "debug";

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Process-wide verbose tracing toggle.
pub trait TraceSwitch: Send + Sync {
    /// Whether verbose tracing is currently on.
    fn is_verbose(&self) -> bool;

    /// Turn verbose tracing on or off.
    ///
    /// # Errors
    ///
    /// Returns an error if the new filter could not be installed.
    fn set_verbose(&self, on: bool) -> Result<()>;
}

/// Switch backed by a reloadable [`EnvFilter`].
pub struct ReloadSwitch {
    handle: reload::Handle<EnvFilter, Registry>,
    base: String,
    verbose: AtomicBool,
}

impl TraceSwitch for ReloadSwitch {
    fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    fn set_verbose(&self, on: bool) -> Result<()> {
        let directives = if on { VERBOSE_FILTER } else { self.base.as_str() };
        self.handle
            .reload(EnvFilter::new(directives))
            .map_err(|e| Error::admin(format!("failed to reload trace filter: {e}")))?;
        self.verbose.store(on, Ordering::Relaxed);
        Ok(())
    }
}

/// Switch that only remembers the requested state.
///
/// Used when tracing is configured elsewhere, e.g. in tests.
#[derive(Debug, Default)]
pub struct FlagSwitch {
    verbose: AtomicBool,
}

impl FlagSwitch {
    /// Create a switch in the given state.
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose: AtomicBool::new(verbose),
        }
    }
}

impl TraceSwitch for FlagSwitch {
    fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    fn set_verbose(&self, on: bool) -> Result<()> {
        self.verbose.store(on, Ordering::Relaxed);
        Ok(())
    }
}

/// Install the global subscriber, writing to stderr.
///
/// The base filter comes from `RUST_LOG`, falling back to `info`.
/// `verbose` starts the process with [`VERBOSE_FILTER`] instead; `json`
/// switches the output to one JSON object per event.
pub fn init(verbose: bool, json: bool) -> ReloadSwitch {
    let base = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string());

    let initial = if verbose { VERBOSE_FILTER } else { base.as_str() };
    let (filter, handle) = reload::Layer::new(EnvFilter::new(initial));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();

    ReloadSwitch {
        handle,
        base,
        verbose: AtomicBool::new(verbose),
    }
}
