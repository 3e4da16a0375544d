// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The duplex bridge between a client websocket and the stdio of a
//! console process running inside a worker pod.
//!
//! Two pipelines share the connection: inbound websocket messages are
//! delivered to the remote stdin (with the linefeed the websocket
//! stripped re-appended), and each non-empty chunk of remote stdout
//! becomes one websocket text message. Websocket writes are serialized
//! through a dedicated sink task. The bridge runs until the remote
//! process exits or either peer closes; there are no timeouts.

use dropshot::WebsocketChannelResult;
use dropshot::WebsocketConnection;
use dropshot::WebsocketConnectionRaw;
use futures::stream::SplitSink;
use futures::stream::SplitStream;
use futures::SinkExt;
use futures::StreamExt;
use kube::api::AttachedProcess;
use slog::{error, info, Logger};
use std::borrow::Cow;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

#[derive(Debug, thiserror::Error)]
enum ConsoleTaskError {
    #[error(transparent)]
    TungsteniteError(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub(crate) async fn run(
    mut process: AttachedProcess,
    conn: WebsocketConnection,
    log: Logger,
) -> WebsocketChannelResult {
    let upgraded = conn.into_inner();
    let ws_stream =
        WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;

    let (ws_sink, ws_stream) = ws_stream.split();

    let stdin = process.stdin().ok_or("exec stream carries no stdin pipe")?;
    let mut stdout =
        process.stdout().ok_or("exec stream carries no stdout pipe")?;

    // Spawn a task to forward queued messages to the client websocket.
    // Both the stdout pump below and the close paths queue into it, so
    // websocket writes are never issued concurrently.
    let (ws_sink_tx, ws_sink_rx) = mpsc::unbounded_channel();
    let mut ws_sink_handle = tokio::spawn(ws_sink_task(ws_sink, ws_sink_rx));

    // Spawn a task to deliver client websocket messages to the remote
    // process stdin.
    let mut ws_recv_handle =
        tokio::spawn(ws_recv_task(ws_stream, stdin, log.clone()));

    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            // Our ws_sink task completed; this is only possible if it
            // fails, since it loops until we drop ws_sink_tx (which doesn't
            // happen until we return!).
            join_result = &mut ws_sink_handle => {
                let result = join_result.expect("ws sink task panicked");
                return result.map_err(Into::into);
            }

            // Our ws_recv task completed; this is possible if the websocket
            // connection fails or is closed by the client. In either case,
            // we're also done.
            join_result = &mut ws_recv_handle => {
                let result = join_result.expect("ws recv task panicked");
                return result.map_err(Into::into);
            }

            // A chunk of output from the console process.
            read_result = stdout.read(&mut buf) => {
                match read_result {
                    Ok(0) => {
                        info!(log, "console process closed its output");
                        let close = CloseFrame {
                            code: CloseCode::Normal,
                            reason: Cow::Borrowed("console stream ended"),
                        };
                        let _ = ws_sink_tx.send(Message::Close(Some(close)));
                        return Ok(());
                    }
                    Ok(n) => {
                        let text =
                            String::from_utf8_lossy(&buf[..n]).into_owned();
                        let _ = ws_sink_tx.send(Message::Text(text));
                    }
                    Err(err) => {
                        error!(
                            log, "error reading from console process";
                            "err" => %err,
                        );
                        let close = CloseFrame {
                            code: CloseCode::Away,
                            reason: Cow::Borrowed("console stream aborted"),
                        };
                        let _ = ws_sink_tx.send(Message::Close(Some(close)));
                        return Err(err.into());
                    }
                }
            }
        }
    }
}

async fn ws_sink_task(
    mut ws_sink: SplitSink<WebSocketStream<WebsocketConnectionRaw>, Message>,
    mut messages: mpsc::UnboundedReceiver<Message>,
) -> Result<(), ConsoleTaskError> {
    while let Some(message) = messages.recv().await {
        ws_sink.send(message).await?;
    }
    Ok(())
}

async fn ws_recv_task<W>(
    mut ws_stream: SplitStream<WebSocketStream<WebsocketConnectionRaw>>,
    mut stdin: W,
    log: Logger,
) -> Result<(), ConsoleTaskError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(message) = ws_stream.next().await {
        match message {
            Ok(Message::Text(input)) => {
                forward_input(&mut stdin, input.as_bytes()).await?;
            }
            Ok(Message::Binary(input)) => {
                forward_input(&mut stdin, &input).await?;
            }
            Ok(Message::Close(_)) => {
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(other) => {
                error!(
                    log,
                    "bogus websocket message; terminating task";
                    "message" => ?other,
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
    }
    info!(log, "remote end closed websocket; terminating task");
    Ok(())
}

async fn forward_input<W: AsyncWrite + Unpin>(
    stdin: &mut W,
    input: &[u8],
) -> Result<(), ConsoleTaskError> {
    stdin.write_all(input).await?;
    // The newline gets stripped off by the websocket - add it back.
    // NOTE - without this the command will not be executed on the remote
    // terminal.
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    Ok(())
}
