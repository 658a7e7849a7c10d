use std::collections::BTreeMap;
use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Error as AnyError};
use tracing::{debug, error};
use tributary_engine::export::{ExportError, ExportResult, Exporter};
use tributary_engine::{Metric, SpanData};

use crate::messaging::{encode, Handshake, Message};

const DEFAULT_HOST: &str = "localhost:8362";
const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Streams records to a collector over TCP.
///
/// Each connection starts with a handshake carrying the resource attributes,
/// followed by one length-prefixed frame per record. A failed write drops the
/// connection; a new one is attempted at most every few seconds.
pub struct TcpExporter {
    connection: Connection,
    buffer: Vec<u8>,
}

impl TcpExporter {
    pub fn new(host: Option<String>, fields: BTreeMap<String, String>) -> TcpExporter {
        TcpExporter {
            connection: Connection::new(host, fields),
            buffer: Vec::new(),
        }
    }

    fn send_all<'a>(&mut self, messages: impl Iterator<Item = Message<'a>>) -> ExportResult {
        self.buffer.clear();

        for message in messages {
            // a record too large for a frame is skipped, not the whole batch
            if let Err(err) = encode(&mut self.buffer, &message) {
                error!(parent: None, "failed to encode record: {err:?}");
            }
        }

        if self.buffer.is_empty() {
            return Ok(());
        }

        self.connection.send(&self.buffer)
    }
}

impl Exporter<SpanData> for TcpExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> ExportResult {
        self.send_all(batch.iter().map(Message::Span))
    }

    fn force_flush(&mut self) -> ExportResult {
        self.connection.flush()
    }

    fn shutdown(&mut self, _timeout: Duration) -> ExportResult {
        self.connection.close();
        Ok(())
    }
}

impl Exporter<Metric> for TcpExporter {
    fn export(&mut self, batch: Vec<Metric>) -> ExportResult {
        self.send_all(batch.iter().map(Message::Metric))
    }

    fn force_flush(&mut self) -> ExportResult {
        self.connection.flush()
    }

    fn shutdown(&mut self, _timeout: Duration) -> ExportResult {
        self.connection.close();
        Ok(())
    }
}

struct Connection {
    host: Option<String>,
    fields: BTreeMap<String, String>,
    stream: Option<TcpStream>,
    last_connect_attempt: Option<Instant>,
}

impl Connection {
    fn new(host: Option<String>, fields: BTreeMap<String, String>) -> Connection {
        Connection {
            host,
            fields,
            stream: None,
            last_connect_attempt: None,
        }
    }

    fn connect(&mut self) -> Result<TcpStream, AnyError> {
        self.last_connect_attempt = Some(Instant::now());

        let host = self.host.as_deref().unwrap_or(DEFAULT_HOST);

        let addr = host
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {host}"))?
            .next()
            .with_context(|| format!("{host} did not resolve to any addresses"))?;

        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .with_context(|| format!("failed to connect to {addr}"))?;

        stream
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .context("failed to configure stream")?;

        debug!(parent: None, "connected to {addr}");

        let handshake = Handshake {
            fields: self.fields.clone(),
        };

        let mut buffer = vec![];
        encode(&mut buffer, &handshake).context("failed to encode handshake")?;
        stream
            .write_all(&buffer)
            .context("failed to send handshake")?;

        Ok(stream)
    }

    fn send(&mut self, payload: &[u8]) -> ExportResult {
        if self.stream.is_none() {
            let throttled = self
                .last_connect_attempt
                .is_some_and(|attempt| attempt.elapsed() < RECONNECT_INTERVAL);
            if throttled {
                return Err(ExportError::Transport("not connected".to_owned()));
            }

            match self.connect() {
                Ok(stream) => self.stream = Some(stream),
                Err(err) => {
                    error!(parent: None, "{err:#}");
                    return Err(ExportError::Transport(format!("{err:#}")));
                }
            }
        }

        let Some(stream) = &mut self.stream else {
            return Err(ExportError::Transport("not connected".to_owned()));
        };

        if let Err(err) = stream.write_all(payload) {
            error!(parent: None, "failed to send payload: {err:?}");
            self.stream = None;
            return Err(ExportError::Transport(err.to_string()));
        }

        Ok(())
    }

    fn flush(&mut self) -> ExportResult {
        match &mut self.stream {
            Some(stream) => stream
                .flush()
                .map_err(|err| ExportError::Transport(err.to_string())),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::SystemTime;

    use tributary_engine::{Attributes, SpanId, Status, TraceFlags, TraceId};

    use super::*;

    fn span() -> SpanData {
        SpanData {
            trace_id: TraceId(1),
            span_id: SpanId(2),
            parent_span_id: None,
            trace_flags: TraceFlags::SAMPLED,
            name: "request".to_owned(),
            target: "app".to_owned(),
            start_time: SystemTime::now(),
            end_time: SystemTime::now(),
            attributes: Attributes::new(),
            status: Status::Unset,
        }
    }

    fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut len = [0u8; 2];
        stream.read_exact(&mut len).unwrap();

        let mut payload = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut payload).unwrap();
        payload
    }

    #[test]
    fn sends_handshake_then_records() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let host = listener.local_addr().unwrap().to_string();

        let fields = BTreeMap::from_iter([("service".to_owned(), "api".to_owned())]);
        let mut exporter = TcpExporter::new(Some(host), fields);

        let record = span();
        Exporter::<SpanData>::export(&mut exporter, vec![record.clone(), record]).unwrap();

        let (mut stream, _) = listener.accept().unwrap();
        let handshake = read_frame(&mut stream);
        let first = read_frame(&mut stream);
        let second = read_frame(&mut stream);

        assert!(!handshake.is_empty());
        assert_eq!(first, second);

        Exporter::<SpanData>::shutdown(&mut exporter, Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn unreachable_collector_is_a_transport_error() {
        // bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let host = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut exporter = TcpExporter::new(Some(host), BTreeMap::new());

        let result = Exporter::<SpanData>::export(&mut exporter, vec![span()]);
        assert!(matches!(result, Err(ExportError::Transport(_))));

        // the next attempt is throttled
        let result = Exporter::<SpanData>::export(&mut exporter, vec![span()]);
        assert_eq!(result, Err(ExportError::Transport("not connected".to_owned())));
    }
}
