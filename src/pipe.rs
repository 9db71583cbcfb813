//! Line-oriented control commands read from stdin while capture runs.
//!
//! An empty line reports device status, a single token retunes the capture
//! channel, and `<channel> <hex>` transmits a message. Acknowledgements go
//! to stderr; stdout stays reserved for the capture stream.

use log::debug;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::device::Sniffer;
use crate::timing::host_millis;

/// Runs for the lifetime of the connection; ends when stdin closes or the
/// device disconnects.
pub async fn run(device: Sniffer) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while device.connected() {
        match lines.next_line().await {
            Ok(Some(line)) => dispatch(&device, &line).await,
            Ok(None) => break,
            Err(e) => {
                debug!("stdin read failed: {e}");
                break;
            }
        }
    }
}

async fn dispatch(device: &Sniffer, line: &str) {
    let args: Vec<&str> = line.split(' ').collect();
    match args.as_slice() {
        [""] => eprintln!("{}", device.status_line()),
        [value] => {
            if let Some(channel) = parse_int(value) {
                if device.channel(channel).await {
                    eprintln!("{{channel={{time={},value={}}}}}", host_millis(), value);
                }
            }
        }
        [channel, message] => {
            let Some(channel) = parse_int(channel) else {
                return;
            };
            let Ok(bytes) = hex::decode(message) else {
                return;
            };
            if device.send(channel, &bytes).await {
                eprintln!(
                    "{{message={{time={},channel={},value={}}}}}",
                    host_millis(),
                    channel,
                    message
                );
            }
        }
        _ => {}
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal integer.
fn parse_int(s: &str) -> Option<i32> {
    if let Some(digits) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i32::from_str_radix(digits, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::parse_int;

    #[test]
    fn decimal_and_hex_accepted() {
        assert_eq!(parse_int("26"), Some(26));
        assert_eq!(parse_int("0"), Some(0));
        assert_eq!(parse_int("0x1a"), Some(26));
        assert_eq!(parse_int("0X0B"), Some(11));
        assert_eq!(parse_int("-1"), Some(-1));
    }

    #[test]
    fn junk_rejected() {
        assert_eq!(parse_int(""), None);
        assert_eq!(parse_int("chan"), None);
        assert_eq!(parse_int("0x"), None);
        assert_eq!(parse_int("1 2"), None);
    }
}
