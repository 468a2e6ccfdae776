//! Command line telemetry observer.
//!
//! Prints a one-line notice for every routed message and, when port
//! monitoring is on, a hex dump plus every decoded field of each datagram.

use crate::channel::{Channel, Subscriber, TelemetryUpdate};
use crate::codec::{TelemetryCodec, Value};
use crate::server::TelemetryServer;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// Hex dump of `bytes`, `per_line` bytes per line, upper-case.
pub fn hex_string(bytes: &[u8], per_line: usize) -> String {
    let per_line = per_line.max(1);
    bytes
        .chunks(per_line)
        .map(|line| {
            line.iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Renders every leaf of `value` as `name = value`, descending into arrays
/// as `name[i]` and containers as `name.field`.
pub fn render_entries(value: &Value, base_name: &str) -> String {
    let mut out = String::new();
    render_into(&mut out, value, base_name);
    out
}

fn render_into(out: &mut String, value: &Value, base_name: &str) {
    match value {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                render_into(out, item, &format!("{}[{}]", base_name, i));
            }
        }
        Value::Container(fields) => {
            for (name, item) in fields {
                render_into(out, item, &format!("{}.{}", base_name, name));
            }
        }
        leaf => {
            let _ = writeln!(out, "{:<60} = {}", base_name, leaf);
        }
    }
}

/// Full port-monitor report for one datagram.
pub fn render_datagram(codec: &dyn TelemetryCodec, datagram: &[u8], from: SocketAddr) -> String {
    let mut out = format!(
        "Telemetry Packet From: {}:UDP {}, {} bits :\n{}\n",
        from.ip(),
        from.port(),
        8 * datagram.len(),
        hex_string(datagram, 16)
    );
    match codec.decode(datagram) {
        Ok((entry, message)) => out.push_str(&render_entries(&message.to_value(), &entry.name)),
        Err(e) => {
            let _ = writeln!(out, "<decode failed: {}>", e);
        }
    }
    out
}

/// Subscriber that reports telemetry on stdout.
#[derive(Debug, Default)]
pub struct CmdLineTelemetry;

impl CmdLineTelemetry {
    /// Creates the observer and attaches it to every channel of `server`.
    /// With `monitor_port`, also installs a raw observer that dumps each
    /// datagram.
    pub fn attach_all(server: &TelemetryServer, monitor_port: bool) -> Arc<Self> {
        let observer = Arc::new(Self);

        if monitor_port {
            let codec = server.codec().clone();
            server.set_raw_observer(move |datagram, from| {
                println!("{}", render_datagram(codec.as_ref(), datagram, from));
            });
        }

        for channel in server.registry().channels() {
            if let Err(e) = server.add_subscriber(channel.key(), observer.clone()) {
                warn!("Could not attach command line observer: {}", e);
            }
        }
        observer
    }

    pub fn format_update(channel: &Channel, update: &TelemetryUpdate) -> String {
        format!(
            "Received telemetry message app ID {} at time {}",
            channel.key(),
            update.message.secondary.seconds
        )
    }
}

impl Subscriber for CmdLineTelemetry {
    fn update(&self, channel: &Channel, update: &TelemetryUpdate) -> anyhow::Result<()> {
        println!("{}", Self::format_update(channel, update));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::codec::{CodecError, DecodedMessage, SchemaEntry};
    use crate::mission::{build_packet, MissionDb};
    use crate::topic::RoutingKey;

    #[test]
    fn test_hex_string_wraps() {
        let bytes: Vec<u8> = (0..20).collect();
        let hex = hex_string(&bytes, 16);
        let lines: Vec<_> = hex.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00 01 02"));
        assert!(lines[0].ends_with("0E 0F"));
        assert_eq!(lines[1], "10 11 12 13");
        assert_eq!(hex_string(&[], 16), "");
    }

    #[test]
    fn test_render_entries_walks_tree() {
        let value = Value::Container(vec![
            ("Counter".to_string(), Value::Unsigned(3)),
            (
                "Temps".to_string(),
                Value::Array(vec![Value::Float(1.5), Value::Signed(-2)]),
            ),
        ]);
        let text = render_entries(&value, "APP/Tlm");
        let lines: Vec<_> = text.lines().map(str::trim_end).collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("APP/Tlm.Counter "));
        assert!(lines[0].ends_with("= 3"));
        assert!(lines[1].starts_with("APP/Tlm.Temps[0]"));
        assert!(lines[1].ends_with("= 1.5"));
        assert!(lines[2].ends_with("= -2"));
        assert_eq!(lines[0].find('='), Some(61));
    }

    #[test]
    fn test_render_datagram_decodes_fields() {
        let db = MissionDb::parse(
            r#"
[[message]]
topic = "CFE_ES/Application/HousekeepingTlm"
topic_id = 88
fields = [{ name = "CommandCounter", type = "u8" }]
"#,
        )
        .expect("db");
        let packet = build_packet(0x5B, 0, 77, &[9]);
        let from: SocketAddr = "127.0.0.1:1235".parse().expect("addr");

        let text = render_datagram(&db, &packet, from);
        assert!(text.starts_with("Telemetry Packet From: 127.0.0.1:UDP 1235, 104 bits :"));
        assert!(text.contains("CFE_ES/HousekeepingTlm.CCSDS.AppId"));
        assert!(text.contains("CFE_ES/HousekeepingTlm.Sec.Seconds"));
        assert!(text.contains("CFE_ES/HousekeepingTlm.Payload.CommandCounter"));
    }

    #[test]
    fn test_render_datagram_reports_decode_failure() {
        struct Failing;
        impl TelemetryCodec for Failing {
            fn decode(&self, _: &[u8]) -> Result<(SchemaEntry, DecodedMessage), CodecError> {
                Err(CodecError::UnknownMessage(1))
            }
        }
        let from: SocketAddr = "10.0.0.1:5000".parse().expect("addr");
        let text = render_datagram(&Failing, &[0u8; 8], from);
        assert!(text.contains("<decode failed:"));
    }

    #[test]
    fn test_format_update() {
        let db = MissionDb::parse(
            r#"
[[message]]
topic = "APP/Application/MSG"
topic_id = 1
"#,
        )
        .expect("db");
        let (entry, message) = db.decode(&build_packet(4, 0, 1234, &[])).expect("decode");
        let channel = Channel::new("APP", "MSG", RoutingKey(4));
        channel.update(entry, message);
        let update = channel.last_update().expect("update");
        assert_eq!(
            CmdLineTelemetry::format_update(&channel, &update),
            "Received telemetry message app ID 4 at time 1234"
        );
    }
}
