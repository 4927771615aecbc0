use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

use crate::enums::Color;

/// Wording for one alert color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorTemplate {
    pub title: &'static str,
    pub status: &'static str,
    pub severity: &'static str,
    /// Slack attachment color.
    pub hex: &'static str,
}

pub fn template(color: Color) -> ColorTemplate {
    match color {
        Color::Red => ColorTemplate {
            title: "CRITICAL ALERT",
            status: "FAILED",
            severity: "critical",
            hex: "#d32f2f",
        },
        Color::Yellow => ColorTemplate {
            title: "DEGRADED ALERT",
            status: "DEGRADED",
            severity: "warning",
            hex: "#f9a825",
        },
        Color::Green => ColorTemplate {
            title: "RECOVERY NOTICE",
            status: "RECOVERED",
            severity: "info",
            hex: "#2e7d32",
        },
        Color::Cyan => ColorTemplate {
            title: "INTERVENTION SUCCESS",
            status: "RESTORED",
            severity: "info",
            hex: "#00acc1",
        },
        Color::Gray => ColorTemplate {
            title: "MAINTENANCE MODE",
            status: "MAINTENANCE",
            severity: "info",
            hex: "#757575",
        },
    }
}

/// One rendered alert, as every notifier sees it.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub monitor: String,
    pub color: Color,
    pub title: String,
    pub status: String,
    pub severity: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(monitor: &str, color: Color, timestamp: DateTime<Utc>) -> Self {
        let t = template(color);
        let message = match color {
            Color::Red => format!("Monitor '{monitor}' is down and automated remediation did not restore it."),
            Color::Yellow => format!("Monitor '{monitor}' failed; remediation ran and recovery is being verified."),
            Color::Green => format!("Monitor '{monitor}' has recovered."),
            Color::Cyan => format!("Monitor '{monitor}' was restored by intervention."),
            Color::Gray => format!("Monitor '{monitor}' is in maintenance."),
        };
        Self {
            id: Uuid::new_v4(),
            monitor: monitor.to_string(),
            color,
            title: t.title.to_string(),
            status: t.status.to_string(),
            severity: t.severity.to_string(),
            message,
            timestamp,
        }
    }

    /// `[CRITICAL ALERT] api: FAILED`
    pub fn headline(&self) -> String {
        format!("[{}] {}: {}", self.title, self.monitor, self.status)
    }

    /// Variables available to body templates.
    pub fn context(&self) -> HashMap<String, String> {
        HashMap::from([
            ("id".to_string(), self.id.to_string()),
            ("monitor".to_string(), self.monitor.clone()),
            ("color".to_string(), self.color.to_string()),
            ("title".to_string(), self.title.clone()),
            ("status".to_string(), self.status.clone()),
            ("severity".to_string(), self.severity.clone()),
            ("message".to_string(), self.message.clone()),
            ("timestamp".to_string(), self.timestamp.to_rfc3339()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colors_render_their_wording() {
        let red = Alert::new("api", Color::Red, Utc::now());
        assert_eq!(red.headline(), "[CRITICAL ALERT] api: FAILED");
        assert_eq!(red.severity, "critical");
        let green = Alert::new("api", Color::Green, Utc::now());
        assert_eq!(green.headline(), "[RECOVERY NOTICE] api: RECOVERED");
        assert_eq!(template(Color::Yellow).severity, "warning");
        assert_eq!(template(Color::Gray).status, "MAINTENANCE");
    }

    #[test]
    fn context_has_every_field() {
        let alert = Alert::new("db", Color::Cyan, Utc::now());
        let ctx = alert.context();
        assert_eq!(ctx["monitor"], "db");
        assert_eq!(ctx["color"], "cyan");
        assert_eq!(ctx["status"], "RESTORED");
        assert!(ctx.contains_key("timestamp"));
    }
}
