// event_relay_protocol: wire protocol shared by the event relay and its clients.
//
// This crate defines the framing, the event type, and the event payload codec
// that both ends of a relay connection speak. It has no networking code; the
// `event_relay` crate layers sockets, readiness polling, and client/relay
// state on top of it.
//
// Module overview:
// - `framing.rs`:  Fixed-width frames: 16 ASCII decimal digits (zero-padded
//                  payload length) followed by the payload. Blocking
//                  `read_frame`/`write_frame` helpers plus an incremental
//                  `FrameDecoder` for non-blocking readers.
// - `event.rs`:    `Event` (a `kind` tag plus named attributes) and `Value`
//                  (the closed union of attribute types), with the JSON
//                  payload codec.
// - `types.rs`:    `ConnectionId`, the relay's handle for a connection.
//
// Design decisions:
// - **JSON payloads.** serde_json with externally tagged values. Decoding can
//   only produce inert data, never arbitrary types.
// - **Framing is payload-agnostic.** Frames carry opaque bytes; only
//   `event.rs` knows the payload is an event.
// - **No async runtime.** Framing works over `std::io::Read`/`Write`, so it
//   fits blocking streams, non-blocking sockets, and in-memory buffers alike.

pub mod event;
pub mod framing;
pub mod types;

pub use event::{DecodeError, EVENT_FORMAT_VERSION, EncodeError, Event, MAX_VALUE_DEPTH, Value};
pub use framing::{
    FrameDecoder, FramingError, HEADER_SIZE, MAX_FRAME_SIZE, decode_header, encode_frame,
    encode_header, read_frame, write_frame,
};
pub use types::ConnectionId;

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Serialize an event, frame it, read the frame back, and decode it.
    fn framed_roundtrip(event: &Event) -> Event {
        let payload = event.to_bytes().unwrap();
        let mut wire = Vec::new();
        write_frame(&mut wire, &payload).unwrap();

        let mut cursor = Cursor::new(&wire);
        let recovered = read_frame(&mut cursor).unwrap();
        Event::from_bytes(&recovered).unwrap()
    }

    #[test]
    fn roundtrip_ping() {
        let event = Event::new("ping").with("n", 1);
        assert_eq!(framed_roundtrip(&event), event);
    }

    #[test]
    fn roundtrip_object_translate() {
        let event = Event::new("OBJECT_TRANSLATE")
            .with("object_tag", "Cube_Local_B")
            .with("location", [0.0, 1.0, 2.5]);
        let recovered = framed_roundtrip(&event);
        assert!(recovered.is_kind("OBJECT_TRANSLATE"));
        assert_eq!(
            recovered.get("object_tag").and_then(Value::as_str),
            Some("Cube_Local_B")
        );
    }

    #[test]
    fn roundtrip_test_event_with_tuple_and_flag() {
        let event = Event::new("test_event")
            .with("sample_tuple", [3, 6, 1])
            .with("sample_flag", true);
        assert_eq!(framed_roundtrip(&event), event);
    }

    #[test]
    fn header_matches_payload_length() {
        let payload = Event::new("ping").to_bytes().unwrap();
        let frame = encode_frame(&payload, MAX_FRAME_SIZE).unwrap();
        let declared = decode_header(&frame[..HEADER_SIZE]).unwrap();
        assert_eq!(declared, payload.len() as u64);
        assert_eq!(frame.len(), HEADER_SIZE + payload.len());
    }

    #[test]
    fn decoder_and_event_codec_compose() {
        let events = [
            Event::new("a").with("x", 1),
            Event::new("b").with("y", "two"),
        ];
        let mut wire = Vec::new();
        for event in &events {
            wire.extend(encode_frame(&event.to_bytes().unwrap(), MAX_FRAME_SIZE).unwrap());
        }

        let mut decoder = FrameDecoder::default();
        decoder.extend(&wire);
        for expected in &events {
            let payload = decoder.next_frame().unwrap().unwrap();
            assert_eq!(&Event::from_bytes(&payload).unwrap(), expected);
        }
        assert_eq!(decoder.next_frame().unwrap(), None);
    }
}
