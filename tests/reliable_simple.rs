use futures_lite::FutureExt;
use relink::{
    client::{
        Client,
        Event as ClientEvent,
    },
    server::{
        Event as ServerEvent,
        ServerParameters,
    },
};
use std::{
    cell::RefCell,
    rc::Rc,
    sync::atomic::{
        AtomicU16,
        Ordering,
    },
    time::Duration,
};
use tokio::{
    task::{
        self,
        LocalSet,
    },
    time,
};

static TEST_NUM_DISPENCER: AtomicU16 = AtomicU16::new(0);

fn test_ports() -> (u16, u16) {
    let test_num = TEST_NUM_DISPENCER.fetch_add(1, Ordering::Relaxed);
    (35000 + test_num * 10, 35000 + test_num * 10 + 1)
}

#[tokio::test]
async fn reliable_echo() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (server_port, client_port) = test_ports();

    LocalSet::new()
        .run_until(async move {
            task::spawn_local(async move {
                let mut server = ServerParameters::default()
                    .bind(([127, 0, 0, 1], server_port))
                    .await
                    .expect("server socket bind");

                loop {
                    match server.next_event().await.expect("server event") {
                        ServerEvent::Message { from, channel, data } => {
                            assert_eq!(channel, 0);
                            assert_eq!(data, b"hello");
                            server
                                .send_reliable(from, 0, b"world")
                                .expect("server sent message");
                        },
                        _ => {},
                    }
                }
            });

            time::sleep(Duration::from_millis(5)).await;

            let mut client =
                Client::connect(([127, 0, 0, 1], client_port), ([127, 0, 0, 1], server_port))
                    .await
                    .expect("client bound");

            let reply = time::timeout(Duration::from_secs(10), async {
                loop {
                    match client.next_event().await.expect("client event") {
                        ClientEvent::Connected => {
                            client.send_reliable(0, b"hello").expect("client sent message");
                        },
                        ClientEvent::Message { channel, data } => {
                            assert_eq!(channel, 0);
                            break data;
                        },
                        _ => {},
                    }
                }
            })
            .await
            .expect("echo received");

            assert_eq!(reply, b"world");
        })
        .await;
}

#[tokio::test]
async fn reliable_stream_stays_in_order() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (server_port, client_port) = test_ports();

    // Kept below the socket buffer capacity: the whole burst is in flight
    // at once and recovery of kernel-dropped datagrams is paced by the RTO.
    let amount = 100;

    LocalSet::new()
        .run_until(async move {
            let server_task = task::spawn_local(async move {
                let mut server = ServerParameters::default()
                    .bind(([127, 0, 0, 1], server_port))
                    .await
                    .expect("server socket bind");

                let mut received = 0;
                loop {
                    match server.next_event().await.expect("server event") {
                        ServerEvent::Connected(peer) => {
                            for i in 0 .. amount {
                                server
                                    .send_reliable(peer, 0, format!("ServerWorld{}", i).as_bytes())
                                    .expect("server sent message");
                            }
                        },
                        ServerEvent::Message { channel, data, .. } => {
                            assert_eq!(channel, 0);
                            assert_eq!(data, format!("ClientHello{}", received).as_bytes());
                            received += 1;
                            if received == amount {
                                break;
                            }
                        },
                        _ => {},
                    }
                }
            });

            time::sleep(Duration::from_millis(5)).await;

            let mut client =
                Client::connect(([127, 0, 0, 1], client_port), ([127, 0, 0, 1], server_port))
                    .await
                    .expect("client bound");

            let client_side = async {
                let mut received = 0;
                loop {
                    match client.next_event().await.expect("client event") {
                        ClientEvent::Connected => {
                            for i in 0 .. amount {
                                client
                                    .send_reliable(0, format!("ClientHello{}", i).as_bytes())
                                    .expect("client sent message");
                            }
                        },
                        ClientEvent::Message { channel, data } => {
                            assert_eq!(channel, 0);
                            assert_eq!(data, format!("ServerWorld{}", received).as_bytes());
                            received += 1;
                        },
                        _ => {},
                    }
                }
            };

            // The client keeps polling until the server saw everything.
            let result = time::timeout(
                Duration::from_secs(60),
                async {
                    server_task.await.expect("server task");
                }
                .or(client_side),
            )
            .await;
            assert!(result.is_ok(), "streams did not finish in time");
        })
        .await;
}

#[tokio::test]
async fn split_message_roundtrips() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (server_port, client_port) = test_ports();

    // Three segments' worth of patterned payload.
    let data: Vec<u8> = (0 .. 4096u32).map(|i| (i % 251) as u8).collect();
    let expected = data.clone();

    LocalSet::new()
        .run_until(async move {
            task::spawn_local(async move {
                let mut server = ServerParameters::default()
                    .bind(([127, 0, 0, 1], server_port))
                    .await
                    .expect("server socket bind");

                loop {
                    match server.next_event().await.expect("server event") {
                        ServerEvent::Message { from, channel, data } => {
                            // Bounce the payload back on the next channel.
                            server
                                .send_reliable(from, channel + 1, &data)
                                .expect("server sent message");
                        },
                        _ => {},
                    }
                }
            });

            time::sleep(Duration::from_millis(5)).await;

            let mut client =
                Client::connect(([127, 0, 0, 1], client_port), ([127, 0, 0, 1], server_port))
                    .await
                    .expect("client bound");

            let reply = time::timeout(Duration::from_secs(10), async {
                loop {
                    match client.next_event().await.expect("client event") {
                        ClientEvent::Connected => {
                            client.send_reliable(7, &data).expect("client sent message");
                        },
                        ClientEvent::Message { channel, data } => {
                            assert_eq!(channel, 8);
                            break data;
                        },
                        _ => {},
                    }
                }
            })
            .await
            .expect("split message received");

            assert_eq!(reply, expected);
        })
        .await;
}

#[tokio::test]
async fn reliable_send_is_acknowledged() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (server_port, client_port) = test_ports();

    LocalSet::new()
        .run_until(async move {
            let acked = Rc::new(RefCell::new(Vec::new()));

            task::spawn_local(async move {
                let mut server = ServerParameters::default()
                    .bind(([127, 0, 0, 1], server_port))
                    .await
                    .expect("server socket bind");

                loop {
                    server.next_event().await.expect("server event");
                }
            });

            time::sleep(Duration::from_millis(5)).await;

            let mut client =
                Client::connect(([127, 0, 0, 1], client_port), ([127, 0, 0, 1], server_port))
                    .await
                    .expect("client bound");

            let acked_inner = acked.clone();
            let result = time::timeout(Duration::from_secs(10), async move {
                loop {
                    match client.next_event().await.expect("client event") {
                        ClientEvent::Connected => {
                            client.send_reliable(0, b"ack me").expect("client sent message");
                        },
                        ClientEvent::Acked { seq } => {
                            acked_inner.borrow_mut().push(seq);
                            break;
                        },
                        _ => {},
                    }
                }
            })
            .await;

            assert!(result.is_ok(), "no acknowledgement arrived");
            assert_eq!(acked.borrow().len(), 1);
        })
        .await;
}
