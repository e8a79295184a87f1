use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use ziggy_voice_rs::config::Config;
use ziggy_voice_rs::net_link::{NetEvent, NetLink};

const STEP: Duration = Duration::from_secs(5);

async fn next_event(rx: &mut mpsc::Receiver<NetEvent>) -> NetEvent {
    timeout(STEP, rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_session_lifecycle() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut config = Config::default();
    config.network.server_url = format!("ws://127.0.0.1:{}/user-audio-input", port);

    let (tx, mut rx) = mpsc::channel(16);
    let (link, net) = NetLink::new(&config, tx).unwrap();
    tokio::spawn(link.run());

    // Nothing is sent before the socket is up.
    assert!(!net.is_connected());
    assert!(!net.send_text("early".to_string()).await);

    let (uri_tx, uri_rx) = oneshot::channel();
    let (received_tx, mut received_rx) = mpsc::channel::<Message>(4);
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let _ = uri_tx.send(req.uri().to_string());
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();
        ws.send(Message::Binary(Bytes::from_static(&[0x01, 0, 0, 0, 0])))
            .await
            .unwrap();
        ws.send(Message::Text(r#"{"type":"transcription","text":"hi"}"#.into()))
            .await
            .unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            let closing = msg.is_close();
            let _ = received_tx.send(msg).await;
            if closing {
                break;
            }
        }
    });

    net.connect().await;
    assert!(matches!(next_event(&mut rx).await, NetEvent::Connected));
    assert!(net.is_connected());

    let uri = uri_rx.await.unwrap();
    assert!(uri.starts_with("/user-audio-input?"), "{}", uri);
    assert!(uri.contains("appIdentifier=ziggy_ai"));
    assert!(uri.contains("serializer=raw"));

    match next_event(&mut rx).await {
        NetEvent::Binary(data) => assert_eq!(&data[..], &[0x01, 0, 0, 0, 0]),
        other => panic!("unexpected {:?}", other),
    }
    match next_event(&mut rx).await {
        NetEvent::Text(text) => assert!(text.contains("transcription")),
        other => panic!("unexpected {:?}", other),
    }

    assert!(net.send_text("hello".to_string()).await);
    let msg = timeout(STEP, received_rx.recv()).await.unwrap().unwrap();
    assert_eq!(msg.into_text().unwrap().as_str(), "hello");

    net.disconnect().await;
    assert!(matches!(next_event(&mut rx).await, NetEvent::Disconnected));
    assert!(!net.is_connected());
    assert!(!net.send_binary(Bytes::from_static(&[1, 2])).await);
}

#[tokio::test]
async fn test_refused_connection_reports_error() {
    // Bind and drop to get a port nobody listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = Config::default();
    config.network.server_url = format!("ws://127.0.0.1:{}/", port);

    let (tx, mut rx) = mpsc::channel(16);
    let (link, net) = NetLink::new(&config, tx).unwrap();
    tokio::spawn(link.run());

    net.connect().await;
    assert!(matches!(next_event(&mut rx).await, NetEvent::Error(_)));
    assert!(!net.is_connected());
}
