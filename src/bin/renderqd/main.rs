mod args;
mod backend;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::{select, signal};
use tokio_tungstenite::tungstenite::handshake::server::{
    Request, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Level};

use crate::args::Args;
use crate::backend::SyntheticBackend;
use renderq::jobs::text_to_image::TextToImageJob;
use renderq::registry::Registry;
use renderq::subs::{OutboundFrame, SubscriptionManager};
use renderq::wire::handler::Dispatcher;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let registry = Registry::new(args.max_concurrency);
    let (subs, queue) = SubscriptionManager::new();
    tokio::spawn(Arc::clone(&subs).run(queue));
    {
        let subs = Arc::clone(&subs);
        registry.set_broadcast_callback(move |job_id, message| {
            subs.broadcast_threadsafe(job_id, message);
        });
    }

    let gpu_lock = Arc::new(tokio::sync::Mutex::new(()));
    registry.register(
        TextToImageJob::TASK_TYPE,
        Arc::new(TextToImageJob::new(
            Arc::new(SyntheticBackend {
                step_duration: Duration::from_millis(250),
            }),
            gpu_lock,
            args.output_dir.clone(),
            args.cache_dir.clone(),
        )),
    );

    let dispatcher = Dispatcher { registry, subs };

    // Cancellation and termination channel.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let listener = match TcpListener::bind((args.listen, args.port)).await {
        Ok(l) => l,
        Err(error) => {
            error!(%error, "failed to listen for connections");
            return ExitCode::from(111);
        },
    };

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let exit_code =
        match accept_loop(cancel, shutdown_hold, listener, dispatcher).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                error!(%error, "encountered runtime error");
                ExitCode::FAILURE
            },
        };

    shutdown_wait.recv().await;

    exit_code
}

async fn accept_loop(
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
    listener: TcpListener,
    dispatcher: Dispatcher,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "listening");

    // Accept incoming connections until an exit signal is sent, and handle
    // each connection as its own task.
    loop {
        match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => return Ok(()),
        } {
            Ok((conn, _)) => {
                tokio::spawn(do_client_loop(
                    cancel.clone(),
                    shutdown_hold.clone(),
                    conn,
                    dispatcher.clone(),
                ));
            },
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };
    }
}

#[instrument(name = "client_loop", err(level = Level::WARN), fields(peer = %conn.peer_addr()?), skip_all)]
async fn do_client_loop(
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    conn: TcpStream,
    dispatcher: Dispatcher,
) -> Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;

    // The client identity rides in on the upgrade request's query string.
    let mut client_id = None;
    let ws = tokio_tungstenite::accept_hdr_async(
        conn,
        |request: &Request, response: HandshakeResponse| {
            client_id = query_client_id(request.uri().query());
            Ok(response)
        },
    )
    .await
    .context("during websocket handshake")?;

    let (mut sink, mut stream) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn_id = dispatcher.subs.connect(tx, client_id);

    // Writer half: drains the outbound queue onto the socket. Ends when
    // the queue closes (connection evicted or this loop finished) or when
    // asked to close because the connection was supplanted.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                OutboundFrame::Message(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                },
                OutboundFrame::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                },
            }
        }
        let _ = sink.close().await;
    });

    let conn_result = loop {
        let msg = select! {
            x = stream.next() => match x {
                None => {
                    debug!("connection dropped");
                    break Ok(())
                },
                Some(m) => m,
            },
            _ = cancel.cancelled() => break Ok(()),
        };

        match msg {
            Ok(Message::Text(text)) => {
                dispatcher.dispatch(conn_id, &text).await;
            },
            Ok(Message::Close(_)) => {
                debug!("client closed");
                break Ok(());
            },
            // Pings and pongs are answered by the protocol layer; binary
            // frames have no meaning here.
            Ok(_) => continue,
            Err(error) => break Err(error.into()),
        }
    };

    // Dropping the connection entry closes the outbound queue, letting the
    // writer flush and exit; subscriptions stay for a reconnect.
    dispatcher.subs.disconnect(conn_id);
    let _ = writer.await;

    conn_result
}

fn query_client_id(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "client_id")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}
