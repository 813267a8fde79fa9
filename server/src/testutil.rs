//! Builders for synthetic MRT records used across unit tests.

/// A framed record: 12-byte common header plus an arbitrary body.
pub fn raw_record(ts: u32, mrt_type: u16, subtype: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + body.len());
    out.extend_from_slice(&ts.to_be_bytes());
    out.extend_from_slice(&mrt_type.to_be_bytes());
    out.extend_from_slice(&subtype.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// A complete BGP4MP MESSAGE record whose BGP payload is an UPDATE with the
/// requested number of withdrawn /24s, announced /24s, and path attributes
/// (one two-byte attribute per type code given).
pub fn bgp4mp_update(ts: u32, withdrawn: usize, nlri: usize, attr_types: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();

    let mut w = Vec::new();
    for i in 0..withdrawn {
        w.push(24u8);
        w.extend_from_slice(&[10, 0, i as u8]);
    }
    payload.extend_from_slice(&(w.len() as u16).to_be_bytes());
    payload.extend_from_slice(&w);

    let mut attrs = Vec::new();
    for &t in attr_types {
        attrs.push(0x80); // optional
        attrs.push(t);
        attrs.push(2);
        attrs.extend_from_slice(&[0, 1]);
    }
    payload.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
    payload.extend_from_slice(&attrs);

    for i in 0..nlri {
        payload.push(24u8);
        payload.extend_from_slice(&[192, 0, i as u8]);
    }

    let mut bgp = Vec::new();
    bgp.extend_from_slice(&[0xff; 16]);
    bgp.extend_from_slice(&((19 + payload.len()) as u16).to_be_bytes());
    bgp.push(2); // UPDATE
    bgp.extend_from_slice(&payload);

    let mut body = Vec::new();
    body.extend_from_slice(&100u16.to_be_bytes()); // peer AS
    body.extend_from_slice(&200u16.to_be_bytes()); // local AS
    body.extend_from_slice(&0u16.to_be_bytes()); // interface index
    body.extend_from_slice(&1u16.to_be_bytes()); // AFI = IPv4
    body.extend_from_slice(&[10, 0, 0, 1]);
    body.extend_from_slice(&[10, 0, 0, 2]);
    body.extend_from_slice(&bgp);

    raw_record(ts, 16, 1, &body)
}

/// A record padded so that header + body occupy exactly `total_len` bytes.
pub fn padded_record(ts: u32, total_len: usize) -> Vec<u8> {
    assert!(total_len >= 12, "record cannot be shorter than its header");
    raw_record(ts, 16, 1, &vec![0u8; total_len - 12])
}
