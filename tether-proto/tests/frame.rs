use serde_json::json;
use tether_proto::{FrameDecoder, Framing, Incoming, Notification, Request, Response, decode, decode_request, encode};

fn frame_through(framing: Framing, payload: &[u8]) -> Vec<u8> {
    let mut wire = Vec::new();
    encode(framing, payload, &mut wire).unwrap();
    let mut d = FrameDecoder::new(framing);
    d.push(&wire);
    let frame = d.next_frame().unwrap().expect("one complete frame");
    assert!(d.next_frame().unwrap().is_none());
    frame
}

#[test]
fn request_survives_line_framing() {
    let req = Request::new(42, "message.send", json!({"to": "wxid_abc", "text": "hi\nthere", "n": [1, 2.5, null]}));
    let got = decode_request(&frame_through(Framing::Line, &req.to_bytes().unwrap())).unwrap();
    assert_eq!(got, req);
}

#[test]
fn response_survives_length_prefixed_framing() {
    let resp = Response::ok(9, json!({"msg_id": "abc", "ok": true}));
    let got = decode(&frame_through(Framing::LengthPrefixed, &resp.to_bytes().unwrap())).unwrap();
    assert_eq!(got, Incoming::Response(resp));
}

#[test]
fn notification_without_params_decodes_as_null() {
    let got = decode(br#"{"method":"login.qrcode_scanned"}"#).unwrap();
    assert_eq!(got, Incoming::Notification(Notification::new("login.qrcode_scanned", serde_json::Value::Null)));
}

#[test]
fn request_params_default_to_null() {
    let req = decode_request(br#"{"id":1,"method":"ping"}"#).unwrap();
    assert_eq!(req, Request::new(1, "ping", serde_json::Value::Null));
}

#[test]
fn garbage_is_a_payload_error_not_a_panic() {
    assert!(decode(b"not json").is_err());
    assert!(decode(br#"{"id":-4}"#).is_err());
    assert!(decode(br#"[1,2,3]"#).is_err());
}
