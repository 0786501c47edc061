//! Cluster wire envelopes.
//!
//! The protobuf framing below is an external contract shared with every
//! other instance participating in the cluster; the field numbers must not
//! change. Deltas travel as a single [`Part`], periodic reconciliation as a
//! [`FullState`] with one part per registered state. The payload bytes
//! inside a part are opaque to the peer.

/// One named state payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Part {
    /// Registry key of the state this payload belongs to. Receivers route
    /// on this field, not on the channel the message arrived on.
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    /// Marshalled state bytes, produced and consumed by the state object.
    #[prost(bytes = "vec", tag = "2")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

/// A snapshot of every state registered on the publishing peer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FullState {
    #[prost(message, repeated, tag = "1")]
    pub parts: ::prost::alloc::vec::Vec<Part>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_part_round_trip() {
        let part = Part {
            key: "nfl".to_string(),
            data: b"payload".to_vec(),
        };

        let bytes = part.encode_to_vec();
        let decoded = Part::decode(bytes.as_slice()).unwrap();

        assert_eq!(decoded, part);
    }

    #[test]
    fn test_full_state_round_trip() {
        let full = FullState {
            parts: vec![
                Part {
                    key: "nfl".to_string(),
                    data: b"a".to_vec(),
                },
                Part {
                    key: "sil".to_string(),
                    data: Vec::new(),
                },
            ],
        };

        let bytes = full.encode_to_vec();
        let decoded = FullState::decode(bytes.as_slice()).unwrap();

        assert_eq!(decoded, full);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        // 0xff is an invalid field header, not a truncation artifact.
        assert!(FullState::decode(&b"\xff\xff\xff"[..]).is_err());
    }
}
