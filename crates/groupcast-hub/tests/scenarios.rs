//! End-to-end scenarios driven through the public hub API with an in-process
//! channel transport.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use groupcast_core::ConnectionId;
use groupcast_hub::{
    ChannelTransport, ConnectOutcome, Connection, Consumer, Dispatch, DropReason, Filter, GroupRelay,
    HandlerContext, HandlerError, Hub, HubError, Pattern, Router, RoomRoutes, Transport, handler_fn,
};
use groupcast_settings::HubSettings;
use parking_lot::Mutex;
use tokio::sync::mpsc;

fn id(s: &str) -> ConnectionId {
    ConnectionId::from(s)
}

fn transport() -> Arc<ChannelTransport> {
    Arc::new(ChannelTransport::from_settings(&HubSettings::default()))
}

async fn next_text(rx: &mut mpsc::Receiver<Bytes>) -> String {
    let bytes = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("delivery within a second")
        .expect("queue open");
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn room_broadcast_follows_membership() {
    let transport = transport();
    let hub = Hub::builder(HubSettings::default(), Arc::clone(&transport) as Arc<dyn Transport>)
        .mount(Consumer::builder("plain").build().unwrap())
        .build()
        .unwrap();

    let mut rx1 = transport.open(id("c1"));
    assert!(hub.on_connect(Connection::new("c1", "/ws/")).await.unwrap().is_accepted());
    assert!(hub.groups().add("room_5", &id("c1")).unwrap());

    let mut rx2 = transport.open(id("c2"));
    assert!(hub.on_connect(Connection::new("c2", "/ws/")).await.unwrap().is_accepted());
    assert!(hub.groups().add("room_5", &id("c2")).unwrap());

    assert_eq!(hub.broadcast("room_5", "hi").await, 2);
    assert_eq!(next_text(&mut rx1).await, "hi");
    assert_eq!(next_text(&mut rx2).await, "hi");

    assert!(hub.on_disconnect(&id("c1")).await);
    assert!(!hub.registry().exists(&id("c1")));
    assert!(hub.groups().groups_of(&id("c1")).is_empty());

    assert_eq!(hub.broadcast("room_5", "bye").await, 1);
    assert_eq!(next_text(&mut rx2).await, "bye");
    assert!(rx1.try_recv().is_err());
}

#[tokio::test]
async fn join_and_leave_routes_select_by_command() {
    let calls: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
    let record = |name: &'static str| {
        let calls = Arc::clone(&calls);
        handler_fn(move |ctx: HandlerContext, _msg| {
            let calls = Arc::clone(&calls);
            async move {
                let room = ctx.param("room").unwrap_or_default().to_owned();
                calls.lock().push((name.to_owned(), room));
                Ok(())
            }
        })
    };
    let room = || Pattern::regex(r"(?P<room>\w+)").unwrap();
    let router = Router::builder()
        .route("join", Filter::new().command("join").field("room", room()), record("join"))
        .route("leave", Filter::new().command("leave").field("room", room()), record("leave"))
        .build();

    let hub = Hub::builder(HubSettings::default(), transport())
        .mount(Consumer::builder("rooms").router(router).build().unwrap())
        .build()
        .unwrap();
    let _ = hub.on_connect(Connection::new("c1", "/")).await.unwrap();

    let out = hub
        .on_message(&id("c1"), Bytes::from_static(br#"{"command":"leave","room":"5"}"#))
        .await;
    assert_matches!(out, Dispatch::Handled { route } if route == "leave");
    assert_eq!(*calls.lock(), vec![("leave".to_owned(), "5".to_owned())]);

    let out = hub
        .on_message(&id("c1"), Bytes::from_static(br#"{"command":"shout","room":"5"}"#))
        .await;
    assert_matches!(out, Dispatch::Dropped(DropReason::NoMatchingFilter));
    assert_eq!(calls.lock().len(), 1);
}

#[tokio::test]
async fn chat_rooms_end_to_end() {
    let transport = transport();
    let router = RoomRoutes::with_default_template()
        .unwrap()
        .install(Router::builder())
        .unwrap()
        .default_handler(GroupRelay::skip_sender())
        .build();
    let hub = Hub::builder(HubSettings::default(), Arc::clone(&transport) as Arc<dyn Transport>)
        .mount(
            Consumer::builder("chat")
                .path(Pattern::regex(r"/chat/(?P<lobby>\w+)/").unwrap())
                .group("lobby_{lobby}")
                .router(router)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let mut alice = transport.open(id("alice"));
    let mut bob = transport.open(id("bob"));
    for who in ["alice", "bob"] {
        assert!(hub.on_connect(Connection::new(who, "/chat/main/")).await.unwrap().is_accepted());
    }

    // Lobby relay skips the sender.
    let out = hub.on_message(&id("alice"), Bytes::from_static(br#"{"text":"hello"}"#)).await;
    assert!(out.is_handled());
    assert_eq!(next_text(&mut bob).await, r#"{"text":"hello"}"#);
    assert!(alice.try_recv().is_err());

    // Only members hear room traffic.
    let join = Bytes::from_static(br#"{"command":"join","room":"rust"}"#);
    assert!(hub.on_message(&id("bob"), join).await.is_handled());
    let send = Bytes::from_static(br#"{"command":"send","room":"rust","message":"ferris"}"#);
    assert!(hub.on_message(&id("bob"), send.clone()).await.is_handled());
    assert_eq!(next_text(&mut bob).await, r#""ferris""#);

    assert!(hub.on_message(&id("alice"), send).await.is_handled());
    assert!(bob.try_recv().is_err());
    assert!(alice.try_recv().is_err());

    assert_eq!(hub.close_all().await, 2);
    assert_eq!(hub.groups().group_count(), 0);
}

#[tokio::test]
async fn template_errors_surface_at_build_time() {
    assert_matches!(
        Consumer::builder("bad").path("/fixed/").group("room_{id}").build(),
        Err(HubError::MalformedGroupNameTemplate { .. })
    );
    assert_matches!(
        RoomRoutes::new("room_{room"),
        Err(HubError::MalformedGroupNameTemplate { .. })
    );
}

#[tokio::test]
async fn rejected_connection_is_never_registered() {
    let hub = Hub::builder(HubSettings::default(), transport())
        .mount(
            Consumer::builder("chat")
                .path(Pattern::regex(r"/chat/(?P<id>\d+)/").unwrap())
                .group("room_{id}")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let outcome = hub.on_connect(Connection::new("c1", "/nowhere/")).await.unwrap();
    assert_matches!(outcome, ConnectOutcome::Rejected(_));
    assert!(hub.registry().is_empty());
    assert_eq!(hub.groups().group_count(), 0);
    assert!(!hub.on_disconnect(&id("c1")).await);
}

#[tokio::test]
async fn closed_queue_does_not_fail_broadcast() {
    let transport = transport();
    let hub = Hub::builder(HubSettings::default(), Arc::clone(&transport) as Arc<dyn Transport>)
        .mount(Consumer::builder("all").group("everyone").build().unwrap())
        .build()
        .unwrap();

    let mut live = transport.open(id("live"));
    drop(transport.open(id("gone")));
    for who in ["live", "gone"] {
        let _ = hub.on_connect(Connection::new(who, "/")).await.unwrap();
    }

    assert_eq!(hub.broadcast("everyone", "still here").await, 1);
    assert_eq!(next_text(&mut live).await, "still here");
    assert_eq!(transport.dropped(&id("gone")), 1);
}

#[tokio::test]
async fn handler_errors_are_contained() {
    let router = Router::builder()
        .route(
            "strict",
            Filter::new().command("strict"),
            handler_fn(|_, msg: groupcast_core::Message| async move {
                match msg.get("value") {
                    Some(_) => Ok(()),
                    None => Err(HandlerError::BadRequest("'value' is required".into())),
                }
            }),
        )
        .build();
    let hub = Hub::builder(HubSettings::default(), transport())
        .mount(Consumer::builder("c").router(router).build().unwrap())
        .build()
        .unwrap();
    let _ = hub.on_connect(Connection::new("c1", "/")).await.unwrap();

    let out = hub.on_message(&id("c1"), Bytes::from_static(br#"{"command":"strict"}"#)).await;
    assert_matches!(out, Dispatch::Failed { error: HandlerError::BadRequest(_), .. });
    let out = hub
        .on_message(&id("c1"), Bytes::from_static(br#"{"command":"strict","value":1}"#))
        .await;
    assert!(out.is_handled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_tolerates_membership_churn() {
    const CHURNERS: usize = 6;
    const PUSHES: usize = 100;

    let transport = transport();
    let hub = Arc::new(
        Hub::builder(HubSettings::default(), Arc::clone(&transport) as Arc<dyn Transport>)
            .mount(Consumer::builder("all").group("everyone").build().unwrap())
            .build()
            .unwrap(),
    );
    let mut anchor = transport.open(id("anchor"));
    assert!(hub.on_connect(Connection::new("anchor", "/")).await.unwrap().is_accepted());

    let churn: Vec<_> = (0..CHURNERS)
        .map(|n| {
            let (hub, transport) = (Arc::clone(&hub), Arc::clone(&transport));
            tokio::spawn(async move {
                let member = id(&format!("m{n}"));
                for _ in 0..50 {
                    let _rx = transport.open(member.clone());
                    let outcome = hub.on_connect(Connection::new(member.clone(), "/")).await.unwrap();
                    assert!(outcome.is_accepted());
                    tokio::task::yield_now().await;
                    assert!(hub.on_disconnect(&member).await);
                    let _ = transport.close(&member);
                }
            })
        })
        .collect();

    let pushes = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            let mut counts = Vec::with_capacity(PUSHES);
            for _ in 0..PUSHES {
                counts.push(hub.broadcast("everyone", "tick").await);
                tokio::task::yield_now().await;
            }
            counts
        })
    };

    for task in churn {
        task.await.unwrap();
    }
    let counts = pushes.await.unwrap();
    assert_eq!(counts.len(), PUSHES);
    assert!(counts.iter().all(|n| (1..=CHURNERS + 1).contains(n)));

    let mut received = 0;
    while anchor.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, PUSHES);
    assert_eq!(hub.groups().member_count("everyone"), 1);
    assert_eq!(hub.registry().len(), 1);
}
