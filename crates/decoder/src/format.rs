//! Performance overlay text.
//!
//! [`FormatInfo`] holds the figures shown in a stream's performance overlay.
//! [`FormatInfo::render`] fills a template with named placeholders:
//!
//! | Placeholder | Value |
//! |---|---|
//! | `{width}`, `{height}`, `{resolution}` | stream geometry |
//! | `{decoder}` | decoder component name |
//! | `{total_fps}`, `{received_fps}`, `{rendered_fps}` | rates over the last two windows |
//! | `{loss_pct}` | frames lost as a percentage of total frames |
//! | `{decode_ms}`, `{render_ms}`, `{e2e_ms}` | mean per-frame latency split |
//!
//! Numeric placeholders take an optional precision, e.g. `{total_fps:.1}`;
//! without one, rates and times print with two decimals. Unknown placeholders
//! are copied through unchanged.

use serde::Serialize;

use sp_common::Resolution;

use crate::stats::VideoStats;

/// Figures for one overlay refresh.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FormatInfo {
    pub resolution: Resolution,
    pub decoder: String,
    pub total_fps: f32,
    pub received_fps: f32,
    pub rendered_fps: f32,
    pub loss_pct: f32,
    pub decode_ms: f32,
    pub render_ms: f32,
    pub e2e_ms: f32,
}

enum Value<'a> {
    Int(u32),
    Float(f32),
    Text(&'a str),
}

impl FormatInfo {
    /// Derive overlay figures from the combined last and live windows.
    pub fn from_stats(resolution: Resolution, decoder: &str, stats: &VideoStats, now_ms: u64) -> Self {
        let fps = stats.fps(now_ms);
        let decode_ms = stats.avg_decode_ms().unwrap_or(0.0);
        let e2e_ms = stats.avg_total_ms().unwrap_or(0.0);
        Self {
            resolution,
            decoder: decoder.to_string(),
            total_fps: fps.total_fps,
            received_fps: fps.received_fps,
            rendered_fps: fps.rendered_fps,
            loss_pct: stats.loss_percent(),
            decode_ms,
            render_ms: (e2e_ms - decode_ms).max(0.0),
            e2e_ms,
        }
    }

    fn lookup(&self, name: &str) -> Option<Value<'_>> {
        Some(match name {
            "width" => Value::Int(self.resolution.width),
            "height" => Value::Int(self.resolution.height),
            "resolution" => return None,
            "decoder" => Value::Text(&self.decoder),
            "total_fps" => Value::Float(self.total_fps),
            "received_fps" => Value::Float(self.received_fps),
            "rendered_fps" => Value::Float(self.rendered_fps),
            "loss_pct" => Value::Float(self.loss_pct),
            "decode_ms" => Value::Float(self.decode_ms),
            "render_ms" => Value::Float(self.render_ms),
            "e2e_ms" => Value::Float(self.e2e_ms),
            _ => return None,
        })
    }

    /// Substitute every known placeholder in `template`.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len() + 32);
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let tail = &rest[open..];
            let Some(close) = tail.find('}') else {
                out.push_str(tail);
                return out;
            };
            let placeholder = &tail[..=close];
            match self.expand(&tail[1..close]) {
                Some(text) => out.push_str(&text),
                None => out.push_str(placeholder),
            }
            rest = &tail[close + 1..];
        }
        out.push_str(rest);
        out
    }

    fn expand(&self, spec: &str) -> Option<String> {
        let (name, precision) = match spec.split_once(":.") {
            Some((name, digits)) => (name, Some(digits.parse::<usize>().ok()?)),
            None => (spec, None),
        };

        if name == "resolution" && precision.is_none() {
            return Some(self.resolution.to_string());
        }

        match (self.lookup(name)?, precision) {
            (Value::Text(text), None) => Some(text.to_string()),
            (Value::Text(_), Some(_)) => None,
            (Value::Int(v), None) => Some(v.to_string()),
            (Value::Int(v), Some(p)) => Some(format!("{:.p$}", f64::from(v))),
            (Value::Float(v), p) => Some(format!("{:.*}", p.unwrap_or(2), v)),
        }
    }
}
