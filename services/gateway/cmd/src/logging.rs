use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

/// Column widths
const COMPONENT_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 7;

/// Line format: `[timestamp] [component] [level] message`
pub struct GatewayLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Log at info level with a `component` field
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log at warn level with a `component` field
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Log at debug level with a `component` field
#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

/// Log at error level with a `component` field
#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

impl GatewayLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: is_terminal(),
        }
    }

    /// Disable ANSI colors
    pub fn without_color(mut self) -> Self {
        self.color_enabled = false;
        self
    }

    /// Component column, padded or truncated to a fixed width
    fn format_component(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("{}-{}", self.service_name, comp),
            None => self.service_name.clone(),
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn format_log_level(&self, level: &tracing::Level) -> String {
        let level_str = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };

        // +2 for the icon
        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH + 2)
    }

    fn color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }

        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    /// Render one line; split out of [`FormatEvent`] for tests
    fn render(
        &self,
        timestamp: &str,
        level: &tracing::Level,
        fields: &FieldVisitor,
    ) -> String {
        let color = self.color_for_level(level);
        let (reset, cyan) = if self.color_enabled {
            (COLOR_RESET, COLOR_CYAN)
        } else {
            ("", "")
        };

        let mut line = format!(
            "{}[{}] [{}] [{}{}{}] {}",
            cyan,
            timestamp,
            self.format_component(fields.component.as_deref()),
            color,
            self.format_log_level(level),
            reset,
            fields.message
        );
        if let Some(peer) = &fields.peer {
            line.push_str(&format!(" peer={}", peer));
        }
        line.push_str(reset);
        line
    }
}

impl<S, N> FormatEvent<S, N> for GatewayLogFormatter
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
        let timestamp = chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        writeln!(
            writer,
            "{}",
            self.render(&timestamp, event.metadata().level(), &visitor)
        )
    }
}

/// Pulls the message, `component` and `peer` fields out of an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    peer: Option<String>,
}

fn unquote(s: String) -> String {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].to_string()
    } else {
        s
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let value = unquote(format!("{:?}", value));
        match field.name() {
            "message" => self.message = value,
            "component" => self.component = Some(value),
            "peer" => self.peer = Some(value),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            "peer" => self.peer = Some(value.to_string()),
            _ => {}
        }
    }
}

/// Color only when writing to something that looks like a terminal
fn is_terminal() -> bool {
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_column_width() {
        let formatter = GatewayLogFormatter::new("gateway").without_color();

        let plain = formatter.format_component(None);
        assert_eq!(plain.len(), COMPONENT_WIDTH);
        assert!(plain.starts_with("gateway "));

        let named = formatter.format_component(Some("cloud"));
        assert_eq!(named.trim_end(), "gateway-cloud");
        assert_eq!(named.len(), COMPONENT_WIDTH);

        let long = formatter.format_component(Some("certificate-refresh"));
        assert_eq!(long.chars().count(), COMPONENT_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_render_line() {
        let formatter = GatewayLogFormatter::new("gateway").without_color();
        let fields = FieldVisitor {
            message: "Uplink started".to_string(),
            component: Some("sim".to_string()),
            peer: Some("0000000000000001".to_string()),
        };

        let line = formatter.render("2026-01-01 00:00:00.000", &tracing::Level::INFO, &fields);
        assert_eq!(
            line,
            "[2026-01-01 00:00:00.000] [gateway-sim         ] [ℹ INFO   ] Uplink started peer=0000000000000001"
        );
    }
}
