//! Console log formatting.
//!
//! Lines read `[timestamp] [component] [level] message`. The component is
//! taken from an explicit `component` field when present (see the
//! `component_*!` macros), otherwise from the crate that emitted the event.

use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 16;
const LEVEL_WIDTH: usize = 7;

/// Event formatter for the daemon's console output
pub struct MeshLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Log at info level tagged with a component
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log at warn level tagged with a component
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Log at error level tagged with a component
#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

impl MeshLogFormatter {
    /// Formatter for `service_name`, coloured when stdout is a terminal
    pub fn new(service_name: impl Into<String>) -> Self {
        let color_enabled =
            std::io::stdout().is_terminal() && std::env::var("TERM").map_or(true, |t| t != "dumb");
        Self {
            service_name: service_name.into(),
            color_enabled,
        }
    }

    fn component_label(&self, component: Option<&str>, target: &str) -> String {
        let name = match component {
            Some(component) => component.to_string(),
            None => target_component(target)
                .unwrap_or(self.service_name.as_str())
                .to_string(),
        };
        if name.chars().count() > COMPONENT_WIDTH {
            let cut: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", cut)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn level_label(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "ERROR",
            Level::WARN => "WARN",
            Level::INFO => "INFO",
            Level::DEBUG => "DEBUG",
            Level::TRACE => "TRACE",
        };
        format!("{:<width$}", label, width = LEVEL_WIDTH)
    }

    fn level_color(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

/// `mesh_routing::engine` becomes `routing`
fn target_component(target: &str) -> Option<&str> {
    let krate = target.split("::").next()?;
    krate.strip_prefix("mesh_")
}

impl<S, N> FormatEvent<S, N> for MeshLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let metadata = event.metadata();
        let level = metadata.level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let (cyan, reset) = if self.color_enabled {
            (COLOR_CYAN, COLOR_RESET)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{}[{}]{} [{}] [{}{}{}] {}",
            cyan,
            timestamp,
            reset,
            self.component_label(visitor.component.as_deref(), metadata.target()),
            self.level_color(level),
            Self::level_label(level),
            reset,
            visitor.message
        )?;
        for (name, value) in &visitor.fields {
            write!(writer, " {}={}", name, value)?;
        }
        writeln!(writer)
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.fields.push((name, value.to_string())),
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            "component" => {
                self.component = Some(format!("{:?}", value).trim_matches('"').to_string())
            }
            name => self.fields.push((name, format!("{:?}", value))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_component() {
        assert_eq!(target_component("mesh_routing::engine"), Some("routing"));
        assert_eq!(target_component("mesh_session"), Some("session"));
        assert_eq!(target_component("vpnmesh"), None);
    }

    #[test]
    fn test_labels() {
        let formatter = MeshLogFormatter {
            service_name: "vpnmesh".into(),
            color_enabled: false,
        };
        assert_eq!(formatter.component_label(None, "vpnmesh").trim_end(), "vpnmesh");
        assert_eq!(formatter.component_label(Some("link"), "mesh_session").trim_end(), "link");
        assert_eq!(
            formatter.component_label(Some("a-very-long-component-name"), "x"),
            "a-very-long-com…"
        );
        assert_eq!(MeshLogFormatter::level_label(&Level::WARN), "WARN   ");
        assert_eq!(formatter.level_color(&Level::ERROR), "");
    }
}
