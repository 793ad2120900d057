//! This module implements the dispatch link: a single long-lived websocket
//! channel to the dispatcher. After the dial it advertises the worker's
//! parallelism, then a reader thread decodes inbound submission requests
//! and a writer thread encodes outbound verdicts. Channel errors are
//! logged and retried after a one second back off; outbound verdicts are
//! never dropped.
//!

use std::net::TcpStream;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::{HeaderValue, StatusCode};
use tungstenite::protocol::Role;
use tungstenite::{Message, WebSocket};

use judge::protocol::{JudgeRequest, JudgeResponse, SubmissionStatus};

error_chain::error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
        Json(::serde_json::Error);
        WebSocket(::tungstenite::Error);
    }

    errors {
        BadEndpoint(url: String) {
            description("malformed dispatcher endpoint")
            display("malformed dispatcher endpoint: {}", url)
        }

        Dial(msg: String) {
            description("websocket handshake failed")
            display("websocket handshake failed: {}", msg)
        }

        HandshakeRejected(status: u16) {
            description("dispatcher rejected the handshake")
            display("dispatcher rejected the handshake with status {}", status)
        }
    }
}

/// Back off applied after a read, write or decode error on the channel.
const BACKOFF: Duration = Duration::from_secs(1);

/// One frame of the dispatcher channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferFrame {
    /// The wrapped verdict.
    pub resp: JudgeResponse,

    /// `1` on the frame opening a fresh submission's response stream, `0`
    /// otherwise. The handshake frame carries the worker's parallelism
    /// here instead.
    pub new_judge: i32
}

/// Compute the `new_judge` flag for an outbound verdict: the frame opening
/// a fresh submission's response stream is the aggregate Judging
/// announcement.
fn new_judge_flag(response: &JudgeResponse) -> i32 {
    if response.case == -1 && response.status == SubmissionStatus::Judging {
        1
    } else {
        0
    }
}

/// The dispatcher link.
///
/// Both directions run over one TCP connection; the reader side gets its
/// own protocol state over a duplicated handle so neither direction blocks
/// the other.
pub struct Transfer {
    reader: WebSocket<TcpStream>,
    writer: WebSocket<TcpStream>
}

impl Transfer {
    /// Dial the dispatcher at `server`, presenting the bearer token, and
    /// advertise the worker's parallelism.
    pub fn connect(server: &str, auth: &str, parallelism: u32) -> Result<Transfer> {
        let mut request = server.into_client_request()
            .chain_err(|| ErrorKind::BadEndpoint(server.to_owned()))
            ?;
        request.headers_mut().insert(
            "Authentication",
            HeaderValue::from_str(auth)
                .chain_err(|| ErrorKind::BadEndpoint(server.to_owned()))?);

        let (host, port) = {
            let uri = request.uri();
            let host = uri.host()
                .map(|host| host.to_owned())
                .ok_or_else(|| Error::from(ErrorKind::BadEndpoint(server.to_owned())))
                ?;
            (host, uri.port_u16().unwrap_or(80))
        };

        let stream = TcpStream::connect((host.as_str(), port))
            .chain_err(|| ErrorKind::BadEndpoint(server.to_owned()))
            ?;
        let reader_stream = stream.try_clone()
            .chain_err(|| ErrorKind::Dial("cannot duplicate the connection".to_owned()))
            ?;

        let (writer, response) = tungstenite::client::client(request, stream)
            .map_err(|e| Error::from(ErrorKind::Dial(e.to_string())))
            ?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(Error::from(
                ErrorKind::HandshakeRejected(response.status().as_u16())));
        }

        let reader = WebSocket::from_raw_socket(reader_stream, Role::Client, None);
        log::info!("connected to the dispatcher at {}", server);

        let mut transfer = Transfer { reader, writer };
        transfer.send_handshake(parallelism)?;
        Ok(transfer)
    }

    /// Transmit the capacity handshake frame.
    fn send_handshake(&mut self, parallelism: u32) -> Result<()> {
        let frame = TransferFrame {
            resp: JudgeResponse::blank(-1),
            new_judge: parallelism as i32
        };
        let encoded = serde_json::to_string(&frame)?;
        self.writer.write_message(Message::Text(encoded))?;
        Ok(())
    }

    /// Start both directions and hand out the worker-facing queues:
    /// inbound submission requests and outbound verdicts.
    pub fn start(self) -> (Receiver<JudgeRequest>, Sender<JudgeResponse>) {
        let (request_tx, request_rx) = unbounded();
        let (response_tx, response_rx) = unbounded();

        let mut reader = self.reader;
        std::thread::spawn(move || reader_loop(&mut reader, request_tx));
        let mut writer = self.writer;
        std::thread::spawn(move || writer_loop(&mut writer, response_rx));

        (request_rx, response_tx)
    }
}

/// Decode inbound frames into submission requests.
fn reader_loop(socket: &mut WebSocket<TcpStream>, requests: Sender<JudgeRequest>) {
    loop {
        let message = match socket.read_message() {
            Ok(message) => message,
            Err(e) => {
                log::error!("dispatcher read failed: {}", e);
                std::thread::sleep(BACKOFF);
                continue;
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Ping(..) | Message::Pong(..) => continue,
            other => {
                log::warn!("unexpected dispatcher frame skipped: {:?}", other);
                continue;
            }
        };

        let request: JudgeRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                log::error!("cannot decode a submission request: {}", e);
                std::thread::sleep(BACKOFF);
                continue;
            }
        };

        if requests.send(request).is_err() {
            // The worker side is gone; nothing left to read for.
            return;
        }
    }
}

/// Encode outbound verdicts. A frame is retried until the channel takes
/// it; verdicts are never dropped.
fn writer_loop(socket: &mut WebSocket<TcpStream>, responses: Receiver<JudgeResponse>) {
    for response in responses.iter() {
        let frame = TransferFrame {
            new_judge: new_judge_flag(&response),
            resp: response
        };
        let encoded = match serde_json::to_string(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                log::error!("cannot encode a verdict frame: {}", e);
                continue;
            }
        };

        while let Err(e) = socket.write_message(Message::Text(encoded.clone())) {
            log::error!("dispatcher write failed: {}", e);
            std::thread::sleep(BACKOFF);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use judge::protocol::JudgeType;

    #[test]
    fn handshake_frame_shape() {
        let frame = TransferFrame {
            resp: JudgeResponse::blank(-1),
            new_judge: 2
        };
        let encoded = serde_json::to_string(&frame).unwrap();

        assert!(encoded.contains("\"sid\":-1"));
        assert!(encoded.contains("\"new_judge\":2"));
    }

    #[test]
    fn only_the_opening_aggregate_is_flagged() {
        let opening = JudgeResponse::aggregate(5, SubmissionStatus::Judging);
        assert_eq!(1, new_judge_flag(&opening));

        let final_aggregate = JudgeResponse::aggregate(5, SubmissionStatus::Accepted);
        assert_eq!(0, new_judge_flag(&final_aggregate));

        let per_case = JudgeResponse::case(5, 0, "a", SubmissionStatus::Judging);
        assert_eq!(0, new_judge_flag(&per_case));
    }

    #[test]
    fn verdict_statuses_encode_as_protocol_integers() {
        let response = JudgeResponse::aggregate(1, SubmissionStatus::Accepted);
        let encoded = serde_json::to_string(&response).unwrap();
        assert!(encoded.contains("\"status\":2"));
    }

    #[test]
    fn submission_requests_decode_with_numerically_ordered_cases() {
        let raw = r#"{
            "sid": 9,
            "code": "print(1)",
            "lang": 1,
            "type": 1,
            "checker": "check",
            "checker_lang": 2,
            "cases": {
                "10": {"name": "j", "input": "c", "output": ""},
                "2": {"name": "b", "input": "b", "output": ""},
                "0": {"name": "a", "input": "a", "output": ""}
            },
            "time": 2,
            "mem": 256
        }"#;
        let request: JudgeRequest = serde_json::from_str(raw).unwrap();

        assert_eq!(9, request.sid);
        assert_eq!(JudgeType::RunningCode, request.judge_type);
        let names: Vec<&str> = request.cases.values()
            .map(|case| case.name.as_str())
            .collect();
        assert_eq!(vec!["a", "b", "j"], names);
    }

    #[test]
    fn requests_without_checker_fields_decode() {
        let raw = r#"{
            "sid": 1,
            "code": "x",
            "lang": 1,
            "type": 0,
            "cases": {"0": {"name": "a", "input": "", "output": "ok"}},
            "time": 1,
            "mem": 64
        }"#;
        let request: JudgeRequest = serde_json::from_str(raw).unwrap();

        assert_eq!(JudgeType::PerfectMatch, request.judge_type);
        assert_eq!("", request.checker);
        assert_eq!(0, request.checker_lang);
    }
}
