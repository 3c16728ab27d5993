//! Newline-delimited JSON transport, used when the executor host lives in a
//! separate process and envelopes travel over its stdio.

use std::sync::Arc;

use coderun_protocol::{Envelope, RunnerError, RunnerResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::adapter::{ChannelEndpoint, EnvelopeSender};

#[derive(Debug, Clone)]
pub struct LineSender {
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl EnvelopeSender for LineSender {
    fn send(&self, envelope: Envelope) -> RunnerResult<()> {
        self.outbound.send(envelope).map_err(|rejected| {
            RunnerError::ChannelClosed(format!(
                "line transport writer stopped before {} envelope for key {}",
                rejected.0.message.tag(),
                rejected.0.key
            ))
        })
    }
}

pub fn encode_envelope(envelope: &Envelope) -> RunnerResult<String> {
    serde_json::to_string(envelope).map_err(|error| {
        RunnerError::Protocol(format!("failed to encode envelope {}: {error}", envelope.key))
    })
}

pub fn decode_envelope(line: &str) -> RunnerResult<Envelope> {
    serde_json::from_str(line)
        .map_err(|error| RunnerError::Protocol(format!("failed to decode envelope: {error}")))
}

/// Spawns the reader and writer pumps for a byte stream pair. Must be called
/// from within a tokio runtime.
pub fn line_endpoint<R, W>(reader: R, writer: W) -> ChannelEndpoint
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    tokio::spawn(run_writer_loop(writer, outbound_rx));
    tokio::spawn(run_reader_loop(reader, inbound_tx));

    ChannelEndpoint::new(
        Arc::new(LineSender {
            outbound: outbound_tx,
        }),
        inbound_rx,
    )
}

async fn run_writer_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<Envelope>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound.recv().await {
        let encoded = match encode_envelope(&envelope) {
            Ok(encoded) => encoded,
            Err(error) => {
                tracing::warn!(key = %envelope.key, error = %error, "dropping unencodable envelope");
                continue;
            }
        };
        let written = async {
            writer.write_all(encoded.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(error) = written {
            tracing::warn!(error = %error, "line transport write failed; closing writer");
            break;
        }
    }
}

async fn run_reader_loop<R>(reader: R, inbound: mpsc::UnboundedSender<Envelope>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_envelope(&line) {
                    Ok(envelope) => {
                        if inbound.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "skipping malformed envelope line");
                    }
                }
            }
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(error = %error, "line transport read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coderun_protocol::{Envelope, Language, Message, ProcessEvent, RequestKey};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::time::timeout;

    use super::{decode_envelope, line_endpoint};

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn endpoints_exchange_envelopes_over_a_duplex_stream() {
        let (left, right) = tokio::io::duplex(4096);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        let client = line_endpoint(left_read, left_write);
        let host = line_endpoint(right_read, right_write);
        let (client_tx, mut client_rx) = client.into_parts();
        let (host_tx, mut host_rx) = host.into_parts();

        client_tx
            .send(Envelope::run_code(RequestKey::new(7), Language::Sql, "select 1;"))
            .expect("send run");
        let received = timeout(TEST_TIMEOUT, host_rx.recv())
            .await
            .expect("host recv timed out")
            .expect("host envelope");
        assert_eq!(
            received,
            Envelope::run_code(RequestKey::new(7), Language::Sql, "select 1;")
        );

        host_tx
            .send(Envelope::reply(
                RequestKey::new(7),
                ProcessEvent::Halt("process exited with code 0".to_owned()),
            ))
            .expect("send exit");
        let reply = timeout(TEST_TIMEOUT, client_rx.recv())
            .await
            .expect("client recv timed out")
            .expect("client envelope");
        assert_eq!(
            reply.message,
            Message::Exit {
                message: "process exited with code 0".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_without_closing_the_channel() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (their_read, their_write) = tokio::io::split(theirs);
        let endpoint = line_endpoint(their_read, their_write);
        let (_sender, mut inbound) = endpoint.into_parts();
        let (_our_read, mut our_write) = tokio::io::split(ours);

        our_write
            .write_all(b"not json\n\n{\"key\":2,\"type\":\"KILL_PROCESS\"}\n")
            .await
            .expect("write fixture lines");

        let envelope = timeout(TEST_TIMEOUT, inbound.recv())
            .await
            .expect("recv timed out")
            .expect("envelope after malformed line");
        assert_eq!(envelope, Envelope::kill(RequestKey::new(2)));
    }

    #[tokio::test]
    async fn writer_emits_one_json_object_per_line() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (their_read, their_write) = tokio::io::split(theirs);
        let endpoint = line_endpoint(their_read, their_write);
        let (our_read, _our_write) = tokio::io::split(ours);
        let mut lines = BufReader::new(our_read).lines();

        endpoint
            .sender()
            .send(Envelope::interact(RequestKey::new(3), "a\nb\n"))
            .expect("send interact");

        let line = timeout(TEST_TIMEOUT, lines.next_line())
            .await
            .expect("read timed out")
            .expect("read line")
            .expect("line present");
        assert_eq!(
            decode_envelope(&line).expect("decode"),
            Envelope::interact(RequestKey::new(3), "a\nb\n")
        );
    }
}
