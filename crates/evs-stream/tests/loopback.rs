//! End-to-end scenarios over a loopback transport pair.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use evs_stream::testing::LoopbackTransport;
use evs_stream::{
    create_stream, Ack, DuplexStream, MuxConfig, MuxError, Multiplexer, ProtocolError,
    StreamError, StreamEvent, StreamOptions, Transport, Value,
};
use tokio::sync::mpsc;

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("scenario timed out")
}

fn connect(config: MuxConfig) -> (Arc<LoopbackTransport>, Multiplexer, Multiplexer) {
    let (t1, t2) = LoopbackTransport::pair();
    let a = Multiplexer::new(t1.clone(), config.clone());
    let b = Multiplexer::new(t2, config);
    (t1, a, b)
}

/// Forward the decoded arguments of `event` into a channel.
fn collect(mux: &Multiplexer, event: &str) -> mpsc::UnboundedReceiver<Vec<Value>> {
    let (tx, rx) = mpsc::unbounded_channel();
    mux.on(event, move |args| {
        let _ = tx.send(args);
    });
    rx
}

#[tokio::test]
async fn test_greet_carries_stream_and_bytes() {
    let (_t1, a, b) = connect(MuxConfig::default());
    let mut greets = collect(&b, "greet");

    let stream_a = create_stream(StreamOptions::default());
    a.emit("greet", vec![Value::from("hi"), Value::Stream(stream_a.clone())])
        .unwrap();

    let args = within(greets.recv()).await.unwrap();
    assert_eq!(args[0], Value::from("hi"));
    let stream_b = args[1].as_stream().unwrap().clone();
    assert_eq!(stream_b.id(), stream_a.id());
    assert!(b.contains(stream_b.id()));

    let reader = tokio::spawn(async move { stream_a.read_to_end().await });
    for chunk in ["one", "two", "three"] {
        within(stream_b.write(chunk.as_bytes().to_vec())).await.unwrap();
    }
    stream_b.finish();

    let received = within(reader).await.unwrap().unwrap();
    assert_eq!(received, b"onetwothree".to_vec());
}

#[tokio::test]
async fn test_pipe_between_hosts() {
    let (_t1, a, b) = connect(MuxConfig::default());
    let mut uploads = collect(&b, "upload");

    let upload = create_stream(StreamOptions {
        high_water_mark: 7,
        ..StreamOptions::default()
    });
    a.emit("upload", vec![Value::Stream(upload.clone())]).unwrap();
    let remote = within(uploads.recv()).await.unwrap()[0]
        .as_stream()
        .unwrap()
        .clone();

    let payload: Vec<u8> = (0..100u8).collect();
    let source = payload.clone();
    let writer = tokio::spawn(async move { upload.pipe_from(&source[..]).await });

    let mut sink = Vec::new();
    let copied = within(remote.pipe_to(&mut sink)).await.unwrap();
    assert_eq!(copied, 100);
    assert_eq!(sink, payload);
    assert_eq!(within(writer).await.unwrap().unwrap(), 100);
}

#[tokio::test]
async fn test_disconnect_aborts_both_sides() {
    let (t1, a, b) = connect(MuxConfig::default());
    let mut opened = collect(&b, "open");

    let mut local_events = Vec::new();
    for _ in 0..3 {
        let stream = create_stream(StreamOptions::default());
        local_events.push(stream.subscribe());
        a.emit("open", vec![Value::Stream(stream)]).unwrap();
    }
    let mut remote_events = Vec::new();
    for _ in 0..3 {
        let args = within(opened.recv()).await.unwrap();
        remote_events.push(args[0].as_stream().unwrap().subscribe());
    }
    assert_eq!(a.len(), 3);
    assert_eq!(b.len(), 3);

    t1.disconnect();

    for rx in local_events.iter_mut().chain(remote_events.iter_mut()) {
        assert_eq!(within(rx.recv()).await, Some(StreamEvent::Close));
        assert_eq!(
            within(rx.recv()).await,
            Some(StreamEvent::Error(StreamError::Aborted))
        );
    }
    assert!(a.is_empty());
    assert!(b.is_empty());
}

#[tokio::test]
async fn test_destroyed_stream_is_not_sent() {
    let (_t1, a, b) = connect(MuxConfig::default());
    let mut pings = collect(&b, "ping");
    let mut uploads = collect(&b, "upload");

    let dead = create_stream(StreamOptions::default());
    dead.destroy();
    let err = a
        .emit("upload", vec![Value::Stream(dead)])
        .unwrap_err();
    assert!(matches!(err, MuxError::Protocol(ProtocolError::Destroyed(_))));

    // Events are delivered in order, so once the ping arrives nothing else
    // is in flight.
    a.emit("ping", Vec::new()).unwrap();
    within(pings.recv()).await.unwrap();
    assert!(uploads.try_recv().is_err());
    assert!(a.is_empty());
    assert!(b.is_empty());
}

#[tokio::test]
async fn test_repeated_stream_is_not_sent() {
    let (_t1, a, b) = connect(MuxConfig::default());
    let mut pings = collect(&b, "ping");
    let mut pairs = collect(&b, "pair");

    let stream = create_stream(StreamOptions::default());
    let mut events = stream.subscribe();
    let err = a
        .emit(
            "pair",
            vec![Value::Stream(stream.clone()), Value::Stream(stream.clone())],
        )
        .unwrap_err();
    assert!(matches!(err, MuxError::Protocol(ProtocolError::AlreadySent(_))));

    a.emit("ping", Vec::new()).unwrap();
    within(pings.recv()).await.unwrap();
    assert!(pairs.try_recv().is_err());
    assert!(a.is_empty());
    assert!(b.is_empty());
    assert!(!stream.is_destroyed());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_force_base64_end_to_end() {
    let config = MuxConfig {
        force_base64: true,
        ..MuxConfig::default()
    };
    let (t1, a, b) = connect(config);

    let (wire_tx, mut wire_rx) = mpsc::unbounded_channel();
    t1.on(
        "$stream-write",
        Arc::new(move |args: Vec<Value>| {
            let _ = wire_tx.send((args[1].clone(), args[2].clone()));
        }),
    );

    let mut opened = collect(&a, "download");
    let local = create_stream(StreamOptions::default());
    b.emit("download", vec![Value::Stream(local.clone())]).unwrap();
    let remote = within(opened.recv()).await.unwrap()[0]
        .as_stream()
        .unwrap()
        .clone();

    let data: &'static [u8] = b"\x00\xffbinary\x7f";
    let reader = tokio::spawn(async move { remote.read().await });
    within(local.write(data)).await.unwrap();

    let chunk = within(reader).await.unwrap().unwrap().unwrap();
    assert_eq!(&chunk[..], data);

    let (wire_chunk, encoding) = within(wire_rx.recv()).await.unwrap();
    assert!(matches!(wire_chunk, Value::String(_)));
    assert_eq!(encoding, Value::from("base64"));
}

#[tokio::test]
async fn test_reply_ack_carries_stream() {
    let (_t1, a, b) = connect(MuxConfig::default());

    let (served_tx, mut served_rx) = mpsc::unbounded_channel::<DuplexStream>();
    b.on("ask", move |args| {
        let Some(ack) = args.last().and_then(Value::as_ack) else {
            return;
        };
        let answer = create_stream(StreamOptions::default());
        let _ = served_tx.send(answer.clone());
        ack.call(vec![Value::from("ok"), Value::Stream(answer)]);
    });

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    let ack = Ack::new(move |args| {
        let _ = reply_tx.send(args);
    });
    a.emit("ask", vec![Value::from("question"), Value::Ack(ack)])
        .unwrap();

    let reply = within(reply_rx.recv()).await.unwrap();
    assert_eq!(reply[0], Value::from("ok"));
    let received = reply[1].as_stream().unwrap().clone();
    let served = within(served_rx.recv()).await.unwrap();
    assert_eq!(received.id(), served.id());
    assert!(a.contains(received.id()));
    assert!(b.contains(served.id()));

    let reader = tokio::spawn(async move { received.read_to_end().await });
    within(served.write_str("answer")).await.unwrap();
    served.finish();
    assert_eq!(within(reader).await.unwrap().unwrap(), b"answer".to_vec());
}

#[tokio::test]
async fn test_remote_error_reaches_peer() {
    let (_t1, a, b) = connect(MuxConfig::default());
    let mut opened = collect(&b, "open");

    let local = create_stream(StreamOptions::default());
    let mut events = local.subscribe();
    a.emit("open", vec![Value::Stream(local.clone())]).unwrap();
    let remote = within(opened.recv()).await.unwrap()[0]
        .as_stream()
        .unwrap()
        .clone();

    remote.error("cannot open file");

    assert_eq!(
        within(events.recv()).await,
        Some(StreamEvent::Error(StreamError::Remote(
            "cannot open file".into()
        )))
    );
    assert_eq!(within(events.recv()).await, Some(StreamEvent::Close));
    assert!(a.is_empty());
}
