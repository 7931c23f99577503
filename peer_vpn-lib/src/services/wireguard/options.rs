use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};

/// Start options, parseable from CLI flags and from JSON requests alike.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
    /// Milliseconds a consumer should wait before connecting when the
    /// provider sits behind NAT.
    pub connect_delay: u32,
    pub port_min: u16,
    pub port_max: u16,
    /// Parent subnet consumer session subnets are carved from.
    pub subnet: Ipv4Cidr,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            connect_delay: 2000,
            port_min: 52820,
            port_max: 53075,
            subnet: "10.182.0.0/16".parse().expect("valid default subnet"),
        }
    }
}

/// Options as sent over the management API. Absent or empty payloads fall
/// back to the defaults.
pub fn parse_json_options(raw: Option<&serde_json::Value>) -> Result<Options, serde_json::Error> {
    match raw {
        Some(value) if !value.is_null() => serde_json::from_value(value.clone()),
        _ => Ok(Options::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn absent_payload_yields_defaults() -> anyhow::Result<()> {
        let options = parse_json_options(None)?;
        assert_eq!(options, Options::default());
        Ok(())
    }

    #[test]
    fn empty_request_yields_defaults() -> anyhow::Result<()> {
        let options = parse_json_options(Some(&serde_json::json!({})))?;
        assert_eq!(options, Options::default());
        Ok(())
    }

    #[test]
    fn valid_request_overrides_every_field() -> anyhow::Result<()> {
        let raw = serde_json::json!({
            "connectDelay": 3000,
            "portMin": 123,
            "portMax": 1234,
            "subnet": "10.10.0.0/16",
        });
        let options = parse_json_options(Some(&raw))?;
        assert_eq!(
            options,
            Options {
                connect_delay: 3000,
                port_min: 123,
                port_max: 1234,
                subnet: "10.10.0.0/16".parse()?,
            }
        );
        Ok(())
    }

    #[rstest]
    #[case(serde_json::json!({"portMin": 1000}), 1000, 53075)]
    #[case(serde_json::json!({"portMax": 60000}), 52820, 60000)]
    fn partial_requests_keep_remaining_defaults(
        #[case] raw: serde_json::Value,
        #[case] port_min: u16,
        #[case] port_max: u16,
    ) -> anyhow::Result<()> {
        let options = parse_json_options(Some(&raw))?;
        assert_eq!(options.port_min, port_min);
        assert_eq!(options.port_max, port_max);
        Ok(())
    }
}
