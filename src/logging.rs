//! Log initialisation.
//!
//! Native consumers call [`init_rust_logging`] to get an `env_logger`
//! formatter on stderr. With the `python` feature, [`init_python_logging`]
//! instead forwards every `log` record into Python's `logging` module so the
//! driver's output follows the host application's handlers and levels.
//!
//! The level comes from `EXG_ACQ_LOG`, then `RUST_LOG`, then `info`.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

/// Environment variable holding the driver's log level.
pub const LOG_ENV: &str = "EXG_ACQ_LOG";

static RUST_LOG_ONCE: Once = Once::new();

pub(crate) fn env_level() -> LevelFilter {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Install the stderr formatter once. Later calls are no-ops.
pub fn init_rust_logging() {
    RUST_LOG_ONCE.call_once(|| {
        let level = env_level();
        let env = Env::default().default_filter_or(level.as_str().to_ascii_lowercase());
        let installed = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
        if installed.is_err() {
            log::debug!("a logger was already installed, keeping it");
        }
    });
}

#[cfg(feature = "python")]
pub use bridge::{init_python_logging, reset_python_logging_cache, set_python_log_level_str};

#[cfg(feature = "python")]
mod bridge {
    use std::collections::HashMap;
    use std::sync::Once;

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use parking_lot::Mutex;
    use pyo3::prelude::*;
    use pyo3::types::{PyModule, PyTuple};

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    /// Python logger object and the most verbose level it accepts.
    struct Target {
        enabled: LevelFilter,
        logger: Py<PyAny>,
    }

    /// `log` backend that forwards into Python's `logging`.
    struct PyLogger {
        top_filter: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        targets: Mutex<HashMap<String, Target>>,
    }

    fn python_level(level: Level) -> u32 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PyLogger {
        fn new(py: Python<'_>, top_filter: LevelFilter) -> PyResult<Self> {
            Ok(Self {
                top_filter: Mutex::new(top_filter),
                logging_mod: py.import("logging")?.unbind(),
                targets: Mutex::new(HashMap::new()),
            })
        }

        /// Most verbose level the Python logger currently has enabled.
        fn probe_level(logger: &Bound<'_, PyAny>) -> PyResult<LevelFilter> {
            for level in [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error] {
                if logger
                    .call_method1("isEnabledFor", (python_level(level),))?
                    .is_truthy()?
                {
                    return Ok(level.to_level_filter());
                }
            }
            Ok(LevelFilter::Off)
        }

        fn resolve(&self, py: Python<'_>, name: &str) -> PyResult<(LevelFilter, Py<PyAny>)> {
            if let Some(target) = self.targets.lock().get(name) {
                return Ok((target.enabled, target.logger.clone_ref(py)));
            }
            let logger = self
                .logging_mod
                .bind(py)
                .call_method1("getLogger", (name,))?;
            let enabled = Self::probe_level(&logger).unwrap_or(LevelFilter::Off);
            let logger = logger.unbind();
            self.targets.lock().insert(
                name.to_string(),
                Target {
                    enabled,
                    logger: logger.clone_ref(py),
                },
            );
            Ok((enabled, logger))
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let name = record.target().replace("::", ".");
            let (enabled, logger) = self.resolve(py, &name)?;
            let level = record.level().to_level_filter();
            if level > enabled || level > *self.top_filter.lock() {
                return Ok(());
            }
            let logger = logger.bind(py);
            let none = py.None();
            let py_record = logger.call_method1(
                "makeRecord",
                (
                    &name,
                    python_level(record.level()),
                    record.file(),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none,
                    &none,
                    &none,
                ),
            )?;
            logger.call_method1("handle", (py_record,))?;
            Ok(())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= *self.top_filter.lock()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust logs into Python's `logging`. Safe to call repeatedly.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        PY_LOG_ONCE.call_once(|| match PyLogger::new(py, level) {
            Ok(logger) => {
                let leaked: &'static PyLogger = Box::leak(Box::new(logger));
                if log::set_logger(leaked).is_ok() {
                    log::set_max_level(level);
                    let _ = PY_LOGGER.set(leaked);
                }
            }
            Err(e) => e.restore(py),
        });
        Ok(())
    }

    /// Forget cached per-target loggers after Python logging was reconfigured.
    pub fn reset_python_logging_cache() {
        if let Some(logger) = PY_LOGGER.get() {
            logger.targets.lock().clear();
        }
    }

    /// Apply `level` (or the environment default) to the bridge.
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        init_python_logging(py)?;
        let level = level.and_then(parse_level).unwrap_or_else(env_level);
        if let Some(logger) = PY_LOGGER.get() {
            *logger.top_filter.lock() = level;
        }
        reset_python_logging_cache();
        log::set_max_level(level);
        Ok(())
    }
}
