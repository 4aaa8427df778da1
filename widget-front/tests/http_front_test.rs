use anyhow::Result;
use livecell_base::error::{ErrorKind, LiveError};
use livecell_base::protocol::{BatchUpdateItem, Priority, RegisterWidgetRequest};
use livecell_base::widget::{ClientId, WidgetId, WidgetProperties, WidgetType, WidgetValue};
use livecell_client::{CoordinatorApi, HttpCoordinator, SchedulerConfig, SessionClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use widget_front::{serve, ServerConfig};

struct Front {
    base_url: String,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl Front {
    async fn start() -> Front {
        let module = app::module::test::new_for_test();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(serve(
            listener,
            module.sessions.clone(),
            ServerConfig::default(),
            async move {
                rx.await.ok();
            },
        ));
        Front {
            base_url: format!("http://{}", addr),
            stop: Some(tx),
            task,
        }
    }

    fn api(&self) -> Arc<HttpCoordinator> {
        Arc::new(HttpCoordinator::new(&self.base_url, Duration::from_secs(2)).unwrap())
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.stop.take() {
            tx.send(()).ok();
        }
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

async fn join(api: Arc<HttpCoordinator>, session: &str, client: &str) -> Arc<SessionClient> {
    SessionClient::connect(
        api,
        Some(session.into()),
        ClientId::new(client),
        SchedulerConfig::default(),
        None,
    )
    .await
    .unwrap()
}

fn slider(id: &str) -> RegisterWidgetRequest {
    RegisterWidgetRequest::new(
        id,
        WidgetType::Slider,
        Some(0.0.into()),
        WidgetProperties::bounded(0.0, 10.0, 2.0),
    )
}

#[tokio::test]
async fn commit_over_http_is_snapped_and_versioned() {
    let front = Front::start().await;
    let client = join(front.api(), "s1", "c1").await;
    client.register_widget(slider("w1")).await.unwrap();
    let w = WidgetId::new("w1");

    let out = client.set_value(&w, 7.0.into()).await.unwrap().unwrap();
    assert_eq!(out.value, WidgetValue::Number(6.0));
    assert_eq!(out.version, 1);
    client.set_value(&w, 2.0.into()).await.unwrap();

    let history = client.history(&w, Some(1)).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].value, WidgetValue::Number(2.0));
    front.shutdown().await;
}

#[tokio::test]
async fn ids_with_reserved_characters_reach_their_widget() {
    let front = Front::start().await;
    let client = join(front.api(), "s 1", "c1").await;
    let id = "cell/3?row#2";
    client.register_widget(slider(id)).await.unwrap();
    let w = WidgetId::new(id);

    let out = client.set_value(&w, 4.0.into()).await.unwrap().unwrap();
    assert_eq!(out.version, 1);
    let history = client.history(&w, None).await.unwrap();
    assert_eq!(history.last().map(|h| h.version), Some(1));
    assert!(client.unregister_widget(&w).await.unwrap());
    front.shutdown().await;
}

#[tokio::test]
async fn rejections_keep_their_kind_across_http() {
    let front = Front::start().await;
    let api = front.api();
    let one = join(api.clone(), "s1", "c1").await;
    let two = join(api.clone(), "s1", "c2").await;
    one.register_widget(slider("w1")).await.unwrap();
    two.resync().await.unwrap();
    let w = WidgetId::new("w1");

    assert!(one.request_lock(&w).await.unwrap());
    let err = two.set_value(&w, 4.0.into()).await.unwrap_err();
    assert_eq!(LiveError::classify(&err), ErrorKind::LockConflict);
    assert_eq!(two.get_widget(&w).unwrap().value, WidgetValue::Number(0.0));
    assert!(one.release_lock(&w).await.unwrap());

    let err = api
        .state(one.session_id(), &WidgetId::new("missing"))
        .await
        .unwrap_err();
    assert_eq!(LiveError::classify(&err), ErrorKind::NotFound);

    let resp = one
        .batch_update(vec![
            BatchUpdateItem::new("w1", 4.0.into(), Priority::Normal),
            BatchUpdateItem::new("w1", WidgetValue::Text("x".into()), Priority::Low),
        ])
        .await
        .unwrap();
    assert_eq!(resp.succeeded.len(), 1);
    assert_eq!(resp.failed[0].code, ErrorKind::ValidationError);
    assert_eq!(one.get_widget(&w).unwrap().value, WidgetValue::Number(4.0));
    front.shutdown().await;
}

#[tokio::test]
async fn events_stream_reaches_other_clients() {
    let front = Front::start().await;
    let api = front.api();
    let one = join(api.clone(), "s1", "c1").await;
    one.register_widget(slider("w1")).await.unwrap();
    let two = join(api.clone(), "s1", "c2").await;
    two.resync().await.unwrap();
    let listener = two.listen().await.unwrap();
    let w = WidgetId::new("w1");

    one.set_value(&w, 8.0.into()).await.unwrap();
    let seen = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if two.get_widget(&w).map(|x| x.version) == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(seen.is_ok());
    assert_eq!(two.get_widget(&w).unwrap().value, WidgetValue::Number(8.0));

    // ending the session closes the stream
    assert!(api.end_session(one.session_id()).await.unwrap());
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap();
    front.shutdown().await;
}
