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
    MAX_SEGMENT_DATA,
};
use std::{
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
    (36000 + test_num * 10, 36000 + test_num * 10 + 1)
}

#[tokio::test]
async fn unreliable_exchange() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (server_port, client_port) = test_ports();

    LocalSet::new()
        .run_until(async move {
            let server_task = task::spawn_local(async move {
                let mut server = ServerParameters::default()
                    .bind(([127, 0, 0, 1], server_port))
                    .await
                    .expect("server socket bind");

                loop {
                    match server.next_event().await.expect("server event") {
                        ServerEvent::Connected(peer) => {
                            server
                                .send_unreliable(peer, 0, b"1HelloWorld1")
                                .expect("server sent message");
                        },
                        ServerEvent::Message { channel, data, .. } => {
                            assert_eq!(channel, 1);
                            assert_eq!(data, b"2HelloWorld2");
                            break;
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

            let result = time::timeout(
                Duration::from_secs(10),
                async {
                    loop {
                        match client.next_event().await.expect("client event") {
                            ClientEvent::Message { channel, data } => {
                                assert_eq!(channel, 0);
                                assert_eq!(data, b"1HelloWorld1");
                                client
                                    .send_unreliable(1, b"2HelloWorld2")
                                    .expect("client sent message");
                            },
                            _ => {},
                        }
                    }
                }
                .or(async {
                    server_task.await.expect("server task");
                }),
            )
            .await;
            assert!(result.is_ok(), "exchange did not finish in time");
        })
        .await;
}

#[tokio::test]
async fn unreliable_split_message_delivers() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (server_port, client_port) = test_ports();

    // Larger than two segments to exercise start, middle and tail.
    let data: Vec<u8> = (0 .. MAX_SEGMENT_DATA * 2 + 300)
        .map(|i| (i % 241) as u8)
        .collect();
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
                        ServerEvent::Connected(peer) => {
                            server
                                .send_unreliable(peer, 3, &data)
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

            let received = time::timeout(Duration::from_secs(10), async {
                loop {
                    match client.next_event().await.expect("client event") {
                        ClientEvent::Message { channel, data } => {
                            assert_eq!(channel, 3);
                            break data;
                        },
                        _ => {},
                    }
                }
            })
            .await
            .expect("split message received");

            assert_eq!(received, expected);
        })
        .await;
}
