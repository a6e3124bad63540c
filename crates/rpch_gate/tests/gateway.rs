// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end tunnel scenarios against a live gateway on a loopback
//! listener, with a scripted RTS engine standing in for the PDU processor.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use rpch_gate::auth::StaticAuth;
use rpch_gate::pdu::{
    ChannelBinding, ChannelGate, ChannelKind, Pdu, PduDisposition, PduEngine, PduProcessor,
    RtsCall, CallerInfo, DREP_LITTLE_ENDIAN, DREP_OFFSET, FRAG_LEN_OFFSET,
};
use rpch_gate::service::RunningGateway;
use rpch_gate::{GatewayBuilder, GatewayConfig};

// Markers the scripted engine understands, stored at byte 2 of each PDU.
const M_CONN_A1: u8 = 0xa1;
const M_CONN_B1: u8 = 0xb1;
const M_CONN_A3: u8 = 0xa3;
const M_CONN_C2: u8 = 0xc2;
const M_DATA: u8 = 0xdd;
const M_FLOW_ACK: u8 = 0xfa;

fn mk_pdu(marker: u8, len: usize) -> Vec<u8> {
    assert!(len >= 12);
    let mut pdu = vec![0u8; len];
    pdu[0] = 5;
    pdu[2] = marker;
    pdu[DREP_OFFSET] = DREP_LITTLE_ENDIAN;
    pdu[FRAG_LEN_OFFSET..FRAG_LEN_OFFSET + 2].copy_from_slice(&(len as u16).to_le_bytes());
    pdu
}

struct ScriptedCall {
    pending: Vec<Pdu>,
}

impl ScriptedCall {
    fn with(pdu: Pdu) -> Box<ScriptedCall> {
        Box::new(ScriptedCall { pending: vec![pdu] })
    }

    fn emit(&mut self, marker: u8) -> bool {
        self.pending.push(Pdu::rts(mk_pdu(marker, 20)));
        true
    }
}

impl RtsCall for ScriptedCall {
    fn take_output(&mut self) -> Vec<Pdu> {
        std::mem::take(&mut self.pending)
    }
    fn conn_c2(&mut self, _window_size: u32) -> bool {
        self.emit(M_CONN_C2)
    }
    fn ping(&mut self) -> bool {
        self.emit(0x50)
    }
    fn out_r2_a2(&mut self) -> bool {
        self.emit(0xa2)
    }
    fn out_r2_a6(&mut self) -> bool {
        self.emit(0xa6)
    }
    fn out_r2_b3(&mut self) -> bool {
        self.emit(0xb3)
    }
    fn flow_control_ack(&mut self, _b: u32, _w: u32, _c: &str) -> bool {
        self.emit(M_FLOW_ACK)
    }
}

struct SinkProcessor;

impl PduProcessor for SinkProcessor {
    fn input(&mut self, _caller: &CallerInfo<'_>, _pdu: &[u8]) -> PduDisposition {
        PduDisposition::Input
    }
}

/// Plays CONN/A1 and CONN/B1 with fixed cookies and forwards data PDUs into
/// a sink processor.
struct ScriptedEngine {
    window: u32,
}

impl PduEngine for ScriptedEngine {
    fn create_processor(&self, _host: &str, _port: u16) -> Option<Box<dyn PduProcessor>> {
        Some(Box::new(SinkProcessor))
    }

    fn rts_input(&self, gate: &mut dyn ChannelGate, pdu: &[u8]) -> PduDisposition {
        match pdu[2] {
            M_CONN_A1 if gate.channel_kind() == ChannelKind::Out => {
                let bound = gate.bind_channel(&ChannelBinding {
                    connection_cookie: "ck".into(),
                    channel_cookie: "out1".into(),
                    client_keepalive: Duration::from_secs(300),
                    window_size: self.window,
                    ..Default::default()
                });
                if !bound || !gate.try_create_vconnection() {
                    return PduDisposition::Error;
                }
                PduDisposition::Output(ScriptedCall::with(Pdu::rts(mk_pdu(M_CONN_A3, 28))))
            }
            M_CONN_B1 if gate.channel_kind() == ChannelKind::In => {
                let bound = gate.bind_channel(&ChannelBinding {
                    connection_cookie: "ck".into(),
                    channel_cookie: "in1".into(),
                    life_time: 1_073_741_824,
                    client_keepalive: Duration::from_secs(300),
                    ..Default::default()
                });
                if !bound || !gate.try_create_vconnection() {
                    return PduDisposition::Error;
                }
                PduDisposition::Input
            }
            M_DATA => PduDisposition::Forward,
            _ => PduDisposition::Terminate,
        }
    }

    fn flow_control_ack(&self, _b: u32, _w: u32, _cookie: &str) -> Option<Pdu> {
        Some(Pdu::rts(mk_pdu(M_FLOW_ACK, 20)))
    }

    fn echo_body(&self) -> Vec<u8> {
        vec![0x0e; 20]
    }
}

fn boot(window: u32) -> RunningGateway {
    let config = GatewayConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        context_num: 16,
        worker_num: 2,
        http_session_timeout: 30,
        ..Default::default()
    };
    GatewayBuilder::new(config)
        .engine(Arc::new(ScriptedEngine { window }))
        .auth(Arc::new(StaticAuth::new().user("u", "p", "/m/u")))
        .build()
        .unwrap()
        .run()
        .unwrap()
}

fn connect(gw: &RunningGateway) -> TcpStream {
    let stream = TcpStream::connect(gw.local_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Reads until the blank line terminating a response head.
fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).expect("response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Reads one framed PDU off the wire.
fn read_pdu(stream: &mut TcpStream) -> Vec<u8> {
    let mut hdr = vec![0u8; 12];
    stream.read_exact(&mut hdr).expect("pdu header");
    let len = u16::from_le_bytes([hdr[FRAG_LEN_OFFSET], hdr[FRAG_LEN_OFFSET + 1]]) as usize;
    let mut rest = vec![0u8; len - 12];
    stream.read_exact(&mut rest).expect("pdu body");
    hdr.extend_from_slice(&rest);
    hdr
}

// base64("u:p")
const AUTH: &str = "Authorization: Basic dTpw\r\n";

fn open_out_channel(gw: &RunningGateway) -> TcpStream {
    let mut out = connect(gw);
    let a1 = mk_pdu(M_CONN_A1, 76);
    write!(
        out,
        "RPC_OUT_DATA /rpc/rpcproxy.dll?host.example:6001 HTTP/1.1\r\n\
         Host: gw\r\n{AUTH}Content-Length: {}\r\n\r\n",
        a1.len()
    )
    .unwrap();
    out.write_all(&a1).unwrap();
    out
}

fn open_in_channel(gw: &RunningGateway) -> TcpStream {
    let mut inn = connect(gw);
    let b1 = mk_pdu(M_CONN_B1, 60);
    write!(
        inn,
        "RPC_IN_DATA /rpc/rpcproxy.dll?host.example:6001 HTTP/1.1\r\n\
         Host: gw\r\n{AUTH}Content-Length: 1073741824\r\n\r\n"
    )
    .unwrap();
    inn.write_all(&b1).unwrap();
    inn
}

#[test]
fn unauth_rpc_in_gets_challenge() {
    let gw = boot(65536);
    let mut c = connect(&gw);
    write!(
        c,
        "RPC_IN_DATA /rpc/rpcproxy.dll?host.example:6001 HTTP/1.1\r\n\
         Host: gw\r\nContent-Length: 65536\r\n\r\n"
    )
    .unwrap();
    let head = read_head(&mut c);
    assert!(head.starts_with("HTTP/1.1 401 Unauthorized"), "{head}");
    assert!(
        head.contains("WWW-Authenticate: Basic realm=\"msrpc realm\""),
        "{head}"
    );
}

#[test]
fn challenge_does_not_drop_the_connection() {
    let gw = boot(65536);
    let mut c = connect(&gw);
    for _ in 0..2 {
        write!(
            c,
            "RPC_IN_DATA /rpc/rpcproxy.dll?host.example:6001 HTTP/1.1\r\n\
             Host: gw\r\nContent-Length: 65536\r\n\r\n"
        )
        .unwrap();
        let head = read_head(&mut c);
        assert!(head.starts_with("HTTP/1.1 401 Unauthorized"), "{head}");
    }
}

#[test]
fn malformed_rpc_uri_gets_400() {
    let gw = boot(65536);
    let mut c = connect(&gw);
    write!(
        c,
        "RPC_IN_DATA /rpc/rpcproxy.dll?host.example HTTP/1.1\r\n\
         Host: gw\r\n{AUTH}Content-Length: 65536\r\n\r\n"
    )
    .unwrap();
    let head = read_head(&mut c);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request"), "{head}");
    assert!(head.contains("Connection: close"), "{head}");
}

#[test]
fn unclaimed_request_is_404() {
    let gw = boot(65536);
    let mut c = connect(&gw);
    write!(c, "GET /nothing HTTP/1.1\r\nHost: gw\r\n\r\n").unwrap();
    let head = read_head(&mut c);
    assert!(head.starts_with("HTTP/1.1 404 Not Found"), "{head}");
}

#[test]
fn echo_request_roundtrip() {
    let gw = boot(65536);
    let mut c = connect(&gw);
    write!(
        c,
        "RPC_IN_DATA /rpc/rpcproxy.dll?host.example:6001 HTTP/1.1\r\n\
         Host: gw\r\n{AUTH}Content-Length: 16\r\n\r\n"
    )
    .unwrap();
    c.write_all(&[0u8; 16]).unwrap();
    let head = read_head(&mut c);
    assert!(head.starts_with("HTTP/1.1 200 Success"), "{head}");
    assert!(head.contains("Content-Length: 20"), "{head}");
    assert!(head.contains("Content-Type: application/rpc"), "{head}");
    let mut body = [0u8; 20];
    c.read_exact(&mut body).unwrap();
    assert_eq!(body, [0x0e; 20]);
}

#[test]
fn out_channel_open_replies_200_with_rts() {
    let gw = boot(65536);
    let mut out = open_out_channel(&gw);
    let head = read_head(&mut out);
    assert!(head.starts_with("HTTP/1.1 200 Success"), "{head}");
    assert!(head.contains("Content-Length: 1073741824"), "{head}");
    assert!(head.contains("Content-Type: application/rpc"), "{head}");
    assert!(head.contains("Persistent-Auth: true"), "{head}");
    let a3 = read_pdu(&mut out);
    assert_eq!(a3[2], M_CONN_A3);
}

#[test]
fn pairing_signals_out_channel_and_c2_flows() {
    let gw = boot(65536);
    let mut out = open_out_channel(&gw);
    let head = read_head(&mut out);
    assert!(head.starts_with("HTTP/1.1 200 Success"), "{head}");
    let a3 = read_pdu(&mut out);
    assert_eq!(a3[2], M_CONN_A3);

    let _inn = open_in_channel(&gw);
    // Pairing promotes the OUT channel to OPENED and ships CONN/C2.
    let c2 = read_pdu(&mut out);
    assert_eq!(c2[2], M_CONN_C2);
}

#[test]
fn flow_control_ack_after_half_window() {
    let gw = boot(4096);
    let mut out = open_out_channel(&gw);
    let _ = read_head(&mut out);
    assert_eq!(read_pdu(&mut out)[2], M_CONN_A3);

    let mut inn = open_in_channel(&gw);
    assert_eq!(read_pdu(&mut out)[2], M_CONN_C2);

    // Drive receive credit below half the window: 2 x 1200 > 4096 / 2.
    inn.write_all(&mk_pdu(M_DATA, 1200)).unwrap();
    inn.write_all(&mk_pdu(M_DATA, 1200)).unwrap();
    let ack = read_pdu(&mut out);
    assert_eq!(ack[2], M_FLOW_ACK);
}

#[test]
fn shutdown_is_clean_with_live_tunnels() {
    let gw = boot(65536);
    let mut out = open_out_channel(&gw);
    let _ = read_head(&mut out);
    let _inn = open_in_channel(&gw);
    gw.stop();
}
