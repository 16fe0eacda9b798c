use anyhow::{Context, Result, bail};
use bytes::Bytes;
use callgate::callgate_core::{
    ChannelConfig, CompletionQueue, OutParam, Operation, PayloadHandling, RegisteredCallRequest,
    Server, ServerConfig, Tag,
};
use callgate::{ECHO_METHOD, connect_loopback};
use std::time::Duration;
use tokio::time::Instant;
use tonic::Code;

const REQUEST_TAG: Tag = Tag(1);
const RESPONSE_TAG: Tag = Tag(2);
const CALL_TAG: Tag = Tag(10);
const SHUTDOWN_TAG: Tag = Tag(99);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let messages: Vec<String> = match std::env::args().skip(1).collect::<Vec<_>>() {
        args if args.is_empty() => vec!["hello".to_string()],
        args => args,
    };

    let server = Server::new(ServerConfig::from_env());
    let server_cq = CompletionQueue::new();
    server.register_completion_queue(&server_cq)?;
    let echo = server.register_method(ECHO_METHOD, None, PayloadHandling::ReadInitialPayload)?;
    server.start()?;

    let expected = messages.len();
    let handler = {
        let server = server.clone();
        let cq = server_cq.clone();
        tokio::spawn(async move {
            for _ in 0..expected {
                let request = RegisteredCallRequest::with_payload();
                server.request_registered_call(&echo, &cq, REQUEST_TAG, &request)?;
                let event = cq.next().await.context("server queue closed")?;
                if let Err(status) = event.result {
                    bail!("request failed: {status}");
                }
                let call = request.call.take().context("no call delivered")?;
                let payload = request
                    .payload
                    .as_ref()
                    .and_then(|p| p.take())
                    .flatten()
                    .unwrap_or_default();

                let cancelled = OutParam::new();
                call.start_batch(
                    &[
                        Operation::send_initial_metadata(vec![]),
                        Operation::send_message(payload),
                        Operation::send_status_from_server(Code::Ok, ""),
                        Operation::recv_close_on_server(&cancelled),
                    ],
                    &cq,
                    RESPONSE_TAG,
                )?;
                cq.next().await.context("server queue closed")?;
            }
            Ok::<(), anyhow::Error>(())
        })
    };

    let channel = connect_loopback(&server, ChannelConfig::new().with_authority("localhost"));
    let client_cq = CompletionQueue::new();
    for message in messages {
        let call = channel.create_call(ECHO_METHOD, Some(Instant::now() + Duration::from_secs(5)), None);
        let reply = OutParam::new();
        let initial_metadata = OutParam::new();
        let status = OutParam::new();
        let started = Instant::now();
        call.start_batch(
            &[
                Operation::send_initial_metadata(vec![]),
                Operation::send_message(Bytes::from(message.clone())),
                Operation::send_close_from_client(),
                Operation::recv_initial_metadata(&initial_metadata),
                Operation::recv_message(&reply),
                Operation::recv_status_on_client(&status),
            ],
            &client_cq,
            CALL_TAG,
        )?;
        client_cq.next().await.context("client queue closed")?;

        let status = status.take().context("no status received")?;
        let reply = reply.take().flatten().unwrap_or_default();
        println!(
            "{message:?} -> {:?} ({:?}, {:?})",
            String::from_utf8_lossy(&reply),
            status.code,
            started.elapsed()
        );
    }

    handler.await??;
    server.shutdown_and_notify(&server_cq, SHUTDOWN_TAG);
    while let Some(event) = server_cq.next().await {
        if event.tag == SHUTDOWN_TAG {
            break;
        }
    }
    println!("Server shut down.");
    Ok(())
}
