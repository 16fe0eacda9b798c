use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use callgate_core::{
    CallRequest, Channel, ChannelConfig, CompletionQueue, MetadataEntry, Operation, OutParam,
    PayloadHandling, RegisteredCallRequest, Server, ServerCall, ServerConfig, Tag,
    TrailingMetadata, loopback_pair,
};
use tokio::time::Instant;
use tonic::Code;
use tonic::metadata::MetadataMap;

fn serve(config: ServerConfig) -> (Server, Arc<CompletionQueue>) {
    let server = Server::new(config);
    let cq = CompletionQueue::new();
    server.register_completion_queue(&cq).unwrap();
    (server, cq)
}

fn connect(server: &Server) -> Channel {
    let (client, transport, incoming) = loopback_pair();
    server.serve(transport, incoming);
    Channel::new(client, ChannelConfig::new().with_authority("loopback.test"))
}

async fn accept(server: &Server, cq: &Arc<CompletionQueue>, tag: Tag) -> ServerCall {
    let request = CallRequest::new();
    server.request_call(cq, tag, &request).unwrap();
    let event = cq.next().await.unwrap();
    assert_eq!(event.tag, tag);
    assert!(event.is_ok());
    request.call.take().unwrap()
}

#[tokio::test]
async fn test_unary_echo() {
    let (server, server_cq) = serve(ServerConfig::default());
    let method = server
        .register_method("/echo.Echo/Say", None, PayloadHandling::ReadInitialPayload)
        .unwrap();
    server.start().unwrap();
    let channel = connect(&server);

    let request = RegisteredCallRequest::with_payload();
    server
        .request_registered_call(&method, &server_cq, Tag(1), &request)
        .unwrap();

    let client_cq = CompletionQueue::new();
    let call = channel.create_call("/echo.Echo/Say", None, None);
    let initial_metadata = OutParam::<MetadataMap>::new();
    let reply = OutParam::new();
    let status = OutParam::<TrailingMetadata>::new();
    call.start_batch(
        &[
            Operation::send_initial_metadata(vec![MetadataEntry::new("x-request", "1")]),
            Operation::send_message("ping"),
            Operation::send_close_from_client(),
            Operation::recv_initial_metadata(&initial_metadata),
            Operation::recv_message(&reply),
            Operation::recv_status_on_client(&status),
        ],
        &client_cq,
        Tag(10),
    )
    .unwrap();

    assert!(server_cq.next().await.unwrap().is_ok());
    let server_call = request.call.take().unwrap();
    let payload = request.payload.as_ref().unwrap().take().unwrap().unwrap();
    assert_eq!(payload, Bytes::from_static(b"ping"));
    assert_eq!(
        request.initial_metadata.take().unwrap().get("x-request").unwrap(),
        "1"
    );
    assert_eq!(server_call.peer(), "loopback:client");

    let cancelled = OutParam::new();
    server_call
        .start_batch(
            &[
                Operation::send_initial_metadata(vec![MetadataEntry::new("x-reply", "yes")]),
                Operation::send_message(payload),
                Operation::send_status_from_server(Code::Ok, "done"),
                Operation::recv_close_on_server(&cancelled),
            ],
            &server_cq,
            Tag(2),
        )
        .unwrap();
    assert!(server_cq.next().await.unwrap().is_ok());
    assert_eq!(cancelled.take(), Some(false));

    let event = client_cq.next().await.unwrap();
    assert_eq!(event.tag, Tag(10));
    assert!(event.is_ok());
    assert_eq!(initial_metadata.take().unwrap().get("x-reply").unwrap(), "yes");
    assert_eq!(reply.take(), Some(Some(Bytes::from_static(b"ping"))));
    let status = status.take().unwrap();
    assert_eq!(status.code, Code::Ok);
    assert_eq!(status.message, "done");
    assert!(!status.was_cancelled);
    assert_eq!(call.peer(), "loopback:server");
}

#[tokio::test]
async fn test_server_streaming() {
    let (server, server_cq) = serve(ServerConfig::default());
    server.start().unwrap();
    let channel = connect(&server);

    let client_cq = CompletionQueue::new();
    let call = channel.create_call("/feed.Feed/Subscribe", None, None);
    call.start_batch(
        &[
            Operation::send_initial_metadata(vec![]),
            Operation::send_message("subscribe"),
            Operation::send_close_from_client(),
        ],
        &client_cq,
        Tag(10),
    )
    .unwrap();
    assert!(client_cq.next().await.unwrap().is_ok());

    let server_call = accept(&server, &server_cq, Tag(1)).await;
    let request = OutParam::new();
    server_call
        .start_batch(&[Operation::recv_message(&request)], &server_cq, Tag(2))
        .unwrap();
    assert!(server_cq.next().await.unwrap().is_ok());
    assert_eq!(request.take(), Some(Some(Bytes::from_static(b"subscribe"))));

    server_call
        .start_batch(&[Operation::send_initial_metadata(vec![])], &server_cq, Tag(3))
        .unwrap();
    assert!(server_cq.next().await.unwrap().is_ok());
    for i in 0..3 {
        server_call
            .start_batch(
                &[Operation::send_message(format!("update-{i}"))],
                &server_cq,
                Tag(4),
            )
            .unwrap();

        let message = OutParam::new();
        call.start_batch(&[Operation::recv_message(&message)], &client_cq, Tag(11))
            .unwrap();
        assert!(client_cq.next().await.unwrap().is_ok());
        assert_eq!(message.take(), Some(Some(Bytes::from(format!("update-{i}")))));
        assert!(server_cq.next().await.unwrap().is_ok());
    }

    server_call
        .start_batch(
            &[Operation::send_status_from_server(Code::Ok, "")],
            &server_cq,
            Tag(5),
        )
        .unwrap();
    assert!(server_cq.next().await.unwrap().is_ok());

    let message = OutParam::new();
    let status = OutParam::new();
    call.start_batch(
        &[
            Operation::recv_message(&message),
            Operation::recv_status_on_client(&status),
        ],
        &client_cq,
        Tag(12),
    )
    .unwrap();
    assert!(client_cq.next().await.unwrap().is_ok());
    assert_eq!(message.take(), Some(None));
    assert!(status.take().unwrap().is_ok());
    assert_eq!(call.receiver().messages_received(), 3);
}

#[tokio::test]
async fn test_client_cancel_reaches_server() {
    let (server, server_cq) = serve(ServerConfig::default());
    server.start().unwrap();
    let channel = connect(&server);

    let client_cq = CompletionQueue::new();
    let call = channel.create_call("/svc.S/Long", None, None);
    call.start_batch(&[Operation::send_initial_metadata(vec![])], &client_cq, Tag(10))
        .unwrap();

    let server_call = accept(&server, &server_cq, Tag(1)).await;
    let cancelled = OutParam::new();
    server_call
        .start_batch(&[Operation::recv_close_on_server(&cancelled)], &server_cq, Tag(2))
        .unwrap();

    call.cancel();
    let event = server_cq.next().await.unwrap();
    assert_eq!(event.tag, Tag(2));
    assert!(event.is_ok());
    assert_eq!(cancelled.take(), Some(true));

    let status = OutParam::new();
    call.start_batch(&[Operation::recv_status_on_client(&status)], &client_cq, Tag(11))
        .unwrap();
    let mut saw_status = false;
    while let Some(event) = client_cq.next().await {
        if event.tag == Tag(11) {
            saw_status = true;
            break;
        }
    }
    assert!(saw_status);
    let status = status.take().unwrap();
    assert_eq!(status.code, Code::Cancelled);
    assert!(status.was_cancelled);
}

#[tokio::test]
async fn test_deadline_ends_unanswered_call() {
    let (server, server_cq) = serve(ServerConfig::default());
    server.start().unwrap();
    let channel = connect(&server);

    let client_cq = CompletionQueue::new();
    let deadline = Instant::now() + Duration::from_millis(50);
    let call = channel.create_call("/svc.S/Slow", Some(deadline), None);
    let status = OutParam::new();
    call.start_batch(
        &[
            Operation::send_initial_metadata(vec![]),
            Operation::recv_status_on_client(&status),
        ],
        &client_cq,
        Tag(10),
    )
    .unwrap();

    let server_call = accept(&server, &server_cq, Tag(1)).await;
    assert_eq!(server_call.deadline(), Some(deadline));

    assert!(client_cq.next().await.unwrap().is_ok());
    assert_eq!(status.take().unwrap().code, Code::DeadlineExceeded);
}

#[tokio::test]
async fn test_shutdown_rejects_new_streams() {
    let (server, server_cq) = serve(ServerConfig::default());
    server.start().unwrap();
    let channel = connect(&server);

    server.shutdown_and_notify(&server_cq, Tag(99));
    assert_eq!(server_cq.next().await.unwrap().tag, Tag(99));

    let client_cq = CompletionQueue::new();
    let call = channel.create_call("/svc.S/M", None, None);
    let status = OutParam::new();
    call.start_batch(
        &[
            Operation::send_initial_metadata(vec![]),
            Operation::send_close_from_client(),
            Operation::recv_status_on_client(&status),
        ],
        &client_cq,
        Tag(10),
    )
    .unwrap();
    assert!(client_cq.next().await.unwrap().is_ok());
    assert_eq!(status.take().unwrap().code, Code::Unavailable);
}
