use serde::{Serialize, Serializer};

/// Subnet a source reached the destination through.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Subnet {
    pub alias: String,
}

/// Network the source sits behind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Via {
    pub subnet: Subnet,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkPathSource {
    pub hostname: String,
    pub via: Option<Via>,
    pub network_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkPathDestination {
    pub hostname: String,
    pub ip_address: String,
    pub port: u16,
}

/// One TTL step of a discovered path. `rtt` is in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkPathHop {
    pub ttl: u8,
    pub ip_address: String,
    pub hostname: String,
    #[serde(serialize_with = "serialize_rtt")]
    pub rtt: f64,
    pub success: bool,
}

/// Whole-valued RTTs are written as integers (`0`, not `0.0`).
fn serialize_rtt<S: Serializer>(rtt: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if rtt.is_finite() && rtt.fract() == 0.0 && rtt.abs() < 1e15 {
        serializer.serialize_i64(*rtt as i64)
    } else {
        serializer.serialize_f64(*rtt)
    }
}

/// Result of a single probe run, forwarded as a network-path event.
///
/// Field order is the wire order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkPath {
    pub timestamp: i64,
    pub namespace: String,
    pub path_id: String,
    pub source: NetworkPathSource,
    pub destination: NetworkPathDestination,
    pub hops: Vec<NetworkPathHop>,
    pub tags: Option<Vec<String>>,
}

impl NetworkPath {
    /// Encode as compact JSON.
    pub fn to_compact_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_path_wire_shape() {
        let path = NetworkPath::default();
        let json = String::from_utf8(path.to_compact_json().expect("serialize")).expect("utf8");
        assert_eq!(
            json,
            r#"{"timestamp":0,"namespace":"","path_id":"","source":{"hostname":"","via":null,"network_id":""},"destination":{"hostname":"","ip_address":"","port":0},"hops":[],"tags":null}"#
        );
    }

    #[test]
    fn test_two_hop_path_compact_bytes() {
        let path = NetworkPath {
            source: NetworkPathSource {
                hostname: "abc".to_string(),
                ..Default::default()
            },
            destination: NetworkPathDestination {
                hostname: "abc".to_string(),
                ip_address: "127.0.0.2".to_string(),
                port: 80,
            },
            hops: vec![
                NetworkPathHop {
                    hostname: "hop_1".to_string(),
                    ip_address: "1.1.1.1".to_string(),
                    ..Default::default()
                },
                NetworkPathHop {
                    hostname: "hop_2".to_string(),
                    ip_address: "1.1.1.2".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let json = String::from_utf8(path.to_compact_json().expect("serialize")).expect("utf8");
        assert_eq!(
            json,
            concat!(
                r#"{"timestamp":0,"namespace":"","path_id":"","#,
                r#""source":{"hostname":"abc","via":null,"network_id":""},"#,
                r#""destination":{"hostname":"abc","ip_address":"127.0.0.2","port":80},"#,
                r#""hops":[{"ttl":0,"ip_address":"1.1.1.1","hostname":"hop_1","rtt":0,"success":false},"#,
                r#"{"ttl":0,"ip_address":"1.1.1.2","hostname":"hop_2","rtt":0,"success":false}],"#,
                r#""tags":null}"#,
            )
        );
    }

    #[test]
    fn test_rtt_encoding() {
        let encode = |rtt: f64| {
            let hop = NetworkPathHop {
                rtt,
                ..Default::default()
            };
            let json = serde_json::to_string(&hop).expect("serialize");
            let start = json.find("\"rtt\":").expect("rtt field") + 6;
            let end = json[start..].find(',').expect("next field") + start;
            json[start..end].to_string()
        };

        assert_eq!(encode(0.0), "0");
        assert_eq!(encode(12.0), "12");
        assert_eq!(encode(0.5), "0.5");
        assert_eq!(encode(5.123), "5.123");
    }

    #[test]
    fn test_hop_serialization() {
        let path = NetworkPath {
            source: NetworkPathSource {
                hostname: "abc".to_string(),
                ..Default::default()
            },
            destination: NetworkPathDestination {
                hostname: "abc".to_string(),
                ip_address: "127.0.0.2".to_string(),
                port: 80,
            },
            hops: vec![NetworkPathHop {
                ttl: 1,
                ip_address: "1.1.1.1".to_string(),
                hostname: "hop_1".to_string(),
                rtt: 0.5,
                success: true,
            }],
            tags: Some(vec!["env:prod".to_string()]),
            ..Default::default()
        };

        let value: serde_json::Value =
            serde_json::from_slice(&path.to_compact_json().expect("serialize")).expect("parse");
        assert_eq!(value["destination"]["ip_address"], "127.0.0.2");
        assert_eq!(value["hops"][0]["ttl"], 1);
        assert_eq!(value["hops"][0]["rtt"], 0.5);
        assert_eq!(value["hops"][0]["success"], true);
        assert_eq!(value["tags"][0], "env:prod");
    }
}
