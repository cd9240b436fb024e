use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use super::AlertSink;
use crate::metrics;
use crate::types::AlertEvent;

/// Telegram bot alert channel. Messages use HTML parse mode, so all
/// device-supplied text is escaped before interpolation.
pub struct TelegramSink {
    api_url: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramSink {
    pub fn new(bot_token: &str, chat_id: &str) -> Result<Self> {
        Ok(Self {
            api_url: format!("https://api.telegram.org/bot{bot_token}/sendMessage"),
            chat_id: chat_id.to_string(),
            client: reqwest::Client::new(),
        })
    }

    fn format_event(event: &AlertEvent) -> String {
        match event {
            AlertEvent::HashrateStagnation {
                device_id,
                device_name,
                hashrate_ghs,
                window,
            } => format!(
                "🚨 <b>Mining Alert</b>\n\n\
                 <b>Device:</b> {} ({})\n\
                 <b>Issue:</b> Hashrate unchanged for {} collections\n\
                 <b>Current Hashrate:</b> {:.2} GH/s\n\n\
                 ⚠️ Device may need attention",
                escape(device_name),
                escape(device_id),
                window,
                hashrate_ghs
            ),
            AlertEvent::DeviceOffline { device_id, device_name, last_seen, error } => {
                let mut message = format!(
                    "🔴 <b>Device Offline Alert</b>\n\n\
                     <b>Device:</b> {} ({})\n\
                     <b>Status:</b> Unable to connect\n\
                     <b>Last Seen:</b> {}\n",
                    escape(device_name),
                    escape(device_id),
                    escape(last_seen)
                );
                if !error.is_empty() {
                    message.push_str(&format!("<b>Error:</b> {}\n", escape(error)));
                }
                message.push_str("\n⚠️ Please check device connectivity");
                message
            }
            AlertEvent::DeviceOnline { device_id, device_name, offline_for } => format!(
                "🟢 <b>Device Back Online</b>\n\n\
                 <b>Device:</b> {} ({})\n\
                 <b>Status:</b> Connection restored\n\
                 <b>Offline Duration:</b> {}\n\n\
                 ✅ Device is collecting data again",
                escape(device_name),
                escape(device_id),
                escape(offline_for)
            ),
            AlertEvent::BestDifficulty { device_id, device_name, current, previous } => {
                let mut message = format!(
                    "🎉 <b>New Best Difficulty!</b>\n\n\
                     <b>Device:</b> {} ({})\n\
                     <b>New Best:</b> {}\n\
                     <b>Previous Best:</b> {}\n",
                    escape(device_name),
                    escape(device_id),
                    metrics::format_difficulty(*current),
                    metrics::format_difficulty(*previous)
                );
                if *previous > 0.0 {
                    let improvement = (current - previous) / previous * 100.0;
                    message.push_str(&format!("<b>Improvement:</b> +{improvement:.1}%\n"));
                }
                message.push_str("\n🔥 Keep it up!");
                message
            }
            AlertEvent::DeviceRestarted { device_id, device_name } => format!(
                "🔄 <b>Device Restart</b>\n\n\
                 <b>Device:</b> {} ({})\n\
                 <b>Reason:</b> Hashrate stagnation detected\n\
                 <b>Action:</b> Automatic restart initiated\n\n\
                 ⚡ Device should resume normal operation shortly",
                escape(device_name),
                escape(device_id)
            ),
        }
    }
}

#[async_trait]
impl AlertSink for TelegramSink {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, event: &AlertEvent) -> Result<()> {
        let payload = json!({
            "chat_id": self.chat_id,
            "text": Self::format_event(event),
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        self.client
            .post(&self.api_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html_in_device_supplied_text() {
        let event = AlertEvent::DeviceOffline {
            device_id: "axe<1>".into(),
            device_name: "R&D Axe".into(),
            last_seen: "2026-01-01 00:00:00".into(),
            error: "tag <b> in error".into(),
        };
        let text = TelegramSink::format_event(&event);
        assert!(text.contains("axe&lt;1&gt;"));
        assert!(text.contains("R&amp;D Axe"));
        assert!(text.contains("tag &lt;b&gt; in error"));
        assert!(!text.contains("tag <b>"));
    }

    #[test]
    fn first_best_omits_the_improvement_line() {
        let first = AlertEvent::BestDifficulty {
            device_id: "axe-01".into(),
            device_name: "Axe".into(),
            current: 22.23e6,
            previous: 0.0,
        };
        let text = TelegramSink::format_event(&first);
        assert!(text.contains("22.23 M"));
        assert!(!text.contains("Improvement"));

        let improved = AlertEvent::BestDifficulty {
            device_id: "axe-01".into(),
            device_name: "Axe".into(),
            current: 1102.5,
            previous: 1049.0,
        };
        let text = TelegramSink::format_event(&improved);
        assert!(text.contains("Improvement"));
        assert!(text.contains("+5.1%"));
    }

    #[test]
    fn stagnation_message_names_the_window() {
        let event = AlertEvent::HashrateStagnation {
            device_id: "nano-02".into(),
            device_name: "Shelf Nano".into(),
            hashrate_ghs: 3.54,
            window: 3,
        };
        let text = TelegramSink::format_event(&event);
        assert!(text.contains("unchanged for 3 collections"));
        assert!(text.contains("3.54 GH/s"));
    }
}
