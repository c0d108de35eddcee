//! End-to-end calls over loopback TCP.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use strato::{
    BusinessError, ChannelConfig, ClusterConfig, CodecConfig, FrameVersion, FrameworkError,
    LocalRegistry, Registry, RpcConfig, RpcContext, ServiceAddress, ServiceRoutes, StratoError,
    TransportError, keys,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Greeting {
    name: String,
    excited: bool,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("strato=debug")
        .with_test_writer()
        .try_init();
}

fn greeter() -> ServiceRoutes {
    ServiceRoutes::new("com.acme.Greeter")
        .with_version("1.0")
        .method("greet", |g: Greeting| async move {
            if g.name.is_empty() {
                return Err(StratoError::business(400, "name cannot be empty"));
            }
            let mark = if g.excited { "!" } else { "." };
            Ok(format!("hello, {}{mark}", g.name))
        })
        .method("add", |(a, b): (i64, i64)| async move { Ok::<_, StratoError>(a + b) })
        .method("slow", |millis: u64| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, StratoError>(millis)
        })
}

fn provider_address() -> ServiceAddress {
    ServiceAddress::new("127.0.0.1", 0, "com.acme.Greeter").with_version("1.0")
}

fn consumer() -> ServiceAddress {
    ServiceAddress::new("127.0.0.1", 0, "com.acme.Greeter").with_version("1.0")
}

fn context(registry: &Arc<LocalRegistry>, config: RpcConfig) -> RpcContext {
    RpcContext::new(config, Handle::current()).with_registry(registry.clone())
}

fn config() -> RpcConfig {
    RpcConfig::default().channel(
        ChannelConfig::default()
            .connections(2)
            .request_timeout(Duration::from_secs(2)),
    )
}

fn greeting(name: &str) -> Greeting {
    Greeting {
        name: name.to_string(),
        excited: true,
    }
}

#[tokio::test]
async fn test_call_through_registry() {
    init_tracing();
    let registry = Arc::new(LocalRegistry::new("local://e2e"));
    let provider = context(&registry, config());
    let consumer_ctx = context(&registry, config());

    provider.expose(&provider_address(), greeter()).await.unwrap();
    let cluster = consumer_ctx.refer(&consumer()).unwrap();

    let reply: String = cluster.invoke("greet", &greeting("ada")).await.unwrap();
    assert_eq!(reply, "hello, ada!");

    let sum: i64 = cluster.invoke("add", &(40_i64, 2_i64)).await.unwrap();
    assert_eq!(sum, 42);

    consumer_ctx.shutdown().await;
    provider.shutdown().await;
}

#[tokio::test]
async fn test_business_error_reaches_consumer() {
    let registry = Arc::new(LocalRegistry::new("local://e2e"));
    let provider = context(&registry, config());
    let consumer_ctx = context(&registry, config());

    provider.expose(&provider_address(), greeter()).await.unwrap();
    let cluster = consumer_ctx.refer(&consumer()).unwrap();

    let err = cluster
        .invoke::<_, String>("greet", &greeting(""))
        .await
        .unwrap_err();
    match err {
        StratoError::Business(BusinessError { code, message }) => {
            assert_eq!(code, 400);
            assert_eq!(message, "name cannot be empty");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_method_is_a_framework_error() {
    let registry = Arc::new(LocalRegistry::new("local://e2e"));
    let provider = context(&registry, config());
    let consumer_ctx = context(&registry, config());

    provider.expose(&provider_address(), greeter()).await.unwrap();
    let cluster = consumer_ctx.refer(&consumer()).unwrap();

    let err = cluster.invoke::<_, String>("wave", &()).await.unwrap_err();
    assert!(matches!(err, StratoError::Framework(FrameworkError::Remote(_))));

    // The connection survives the failed call.
    let sum: i64 = cluster.invoke("add", &(1_i64, 2_i64)).await.unwrap();
    assert_eq!(sum, 3);
}

#[tokio::test]
async fn test_msgpack_selected_by_consumer() {
    let registry = Arc::new(LocalRegistry::new("local://e2e"));
    let provider = context(&registry, config());
    let consumer_ctx = context(&registry, config());

    provider.expose(&provider_address(), greeter()).await.unwrap();
    let cluster = consumer_ctx
        .refer(&consumer().with_option(keys::SERIALIZATION, "2"))
        .unwrap();

    let reply: String = cluster.invoke("greet", &greeting("grace")).await.unwrap();
    assert_eq!(reply, "hello, grace!");
}

#[tokio::test]
async fn test_legacy_framing_consumer() {
    let registry = Arc::new(LocalRegistry::new("local://e2e"));
    let provider = context(&registry, config());
    let legacy = config().channel(
        ChannelConfig::default()
            .connections(1)
            .codec(CodecConfig::default().encode_version(FrameVersion::Legacy)),
    );
    let consumer_ctx = context(&registry, legacy);

    provider.expose(&provider_address(), greeter()).await.unwrap();
    let cluster = consumer_ctx.refer(&consumer()).unwrap();

    let sum: i64 = cluster.invoke("add", &(20_i64, 22_i64)).await.unwrap();
    assert_eq!(sum, 42);
}

#[tokio::test]
async fn test_failover_skips_dead_provider() {
    let registry = Arc::new(LocalRegistry::new("local://e2e"));
    let provider = context(&registry, config());
    let consumer_ctx = context(
        &registry,
        config().cluster(ClusterConfig::default().balancer("round_robin")),
    );

    let live = provider.expose(&provider_address(), greeter()).await.unwrap();

    // Advertise an address nothing listens on.
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let dead = live.with_endpoint("127.0.0.1", dead_port);
    registry.register(&dead).unwrap();

    let cluster = consumer_ctx.refer(&consumer()).unwrap();
    assert_eq!(cluster.balancer().snapshot().len(), 2);

    for i in 0..6_i64 {
        let sum: i64 = cluster.invoke("add", &(i, 1_i64)).await.unwrap();
        assert_eq!(sum, i + 1);
    }
}

#[tokio::test]
async fn test_failfast_surfaces_timeout() {
    let registry = Arc::new(LocalRegistry::new("local://e2e"));
    let provider = context(&registry, config());
    let consumer_ctx = context(&registry, config());

    provider.expose(&provider_address(), greeter()).await.unwrap();
    let cluster = consumer_ctx
        .refer(
            &consumer()
                .with_option(keys::CLUSTER, "failfast")
                .with_option(keys::TIMEOUT, "50"),
        )
        .unwrap();

    let err = cluster.invoke::<_, u64>("slow", &500_u64).await.unwrap_err();
    match err {
        StratoError::Framework(FrameworkError::Invocation { cause, .. }) => {
            assert!(matches!(
                *cause,
                StratoError::Transport(TransportError::Timeout(_))
            ));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_packaged_failure_when_not_surfaced() {
    let registry = Arc::new(LocalRegistry::new("local://e2e"));
    let consumer_ctx = context(
        &registry,
        config().cluster(ClusterConfig::default().surface_exceptions(false)),
    );
    let cluster = consumer_ctx.refer(&consumer()).unwrap();

    let reply = cluster
        .call(strato::Request::new("com.acme.Greeter", "add").with_version("1.0"))
        .await
        .unwrap();
    assert!(matches!(
        reply.error(),
        Some(StratoError::Framework(FrameworkError::NoProviderAvailable(_)))
    ));
}

#[tokio::test]
async fn test_hidden_provider_leaves_the_live_set() {
    let registry = Arc::new(LocalRegistry::new("local://e2e"));
    let provider = context(&registry, config());
    let consumer_ctx = context(&registry, config());

    let cluster = consumer_ctx.refer(&consumer()).unwrap();
    assert!(cluster.balancer().snapshot().is_empty());

    let advertised = provider.expose(&provider_address(), greeter()).await.unwrap();
    assert_eq!(cluster.balancer().snapshot().len(), 1);
    let sum: i64 = cluster.invoke("add", &(1_i64, 1_i64)).await.unwrap();
    assert_eq!(sum, 2);

    assert!(provider.hide(&advertised).await);
    assert!(cluster.balancer().snapshot().is_empty());

    let err = cluster.invoke::<_, i64>("add", &(1_i64, 1_i64)).await.unwrap_err();
    assert!(matches!(
        err,
        StratoError::Framework(FrameworkError::NoProviderAvailable(_))
    ));
}

#[tokio::test]
async fn test_services_share_one_port() {
    let registry = Arc::new(LocalRegistry::new("local://e2e"));
    let provider = context(&registry, config());
    let consumer_ctx = context(&registry, config());

    let echo = ServiceRoutes::new("com.acme.Echo")
        .method("echo", |s: String| async move { Ok::<_, StratoError>(s) });

    let greeter_at = provider.expose(&provider_address(), greeter()).await.unwrap();
    let echo_at = provider
        .expose(&ServiceAddress::new("127.0.0.1", 0, "com.acme.Echo"), echo)
        .await
        .unwrap();
    assert_eq!(greeter_at.port(), echo_at.port());

    let echo = consumer_ctx
        .refer(&ServiceAddress::new("127.0.0.1", 0, "com.acme.Echo"))
        .unwrap();
    let reply: String = echo.invoke("echo", &"ping".to_string()).await.unwrap();
    assert_eq!(reply, "ping");

    let greeter = consumer_ctx.refer(&consumer()).unwrap();
    let sum: i64 = greeter.invoke("add", &(2_i64, 2_i64)).await.unwrap();
    assert_eq!(sum, 4);
}

#[tokio::test]
async fn test_duplicate_expose_rejected() {
    let registry = Arc::new(LocalRegistry::new("local://e2e"));
    let provider = context(&registry, config());

    let advertised = provider.expose(&provider_address(), greeter()).await.unwrap();
    let err = provider
        .expose(&provider_address(), greeter())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StratoError::Framework(FrameworkError::DuplicateExpose(_))
    ));
    assert_eq!(provider.exposed(), vec![advertised.clone()]);

    assert!(provider.hide(&advertised).await);
    let again = provider.expose(&provider_address(), greeter()).await.unwrap();
    assert_eq!(registry.providers("com.acme.Greeter:1.0"), vec![again]);
}

#[tokio::test]
async fn test_broadcast_reaches_every_provider() {
    let registry = Arc::new(LocalRegistry::new("local://e2e"));
    let first = context(&registry, config());
    let second = context(&registry, config());
    let consumer_ctx = context(&registry, config());

    let hits = Arc::new(AtomicUsize::new(0));
    let counting = |hits: Arc<AtomicUsize>| {
        ServiceRoutes::new("com.acme.Counter").method("hit", move |(): ()| {
            let hits = hits.clone();
            async move { Ok::<_, StratoError>(hits.fetch_add(1, Ordering::SeqCst)) }
        })
    };
    let address = ServiceAddress::new("127.0.0.1", 0, "com.acme.Counter");
    first.expose(&address, counting(hits.clone())).await.unwrap();
    second.expose(&address, counting(hits.clone())).await.unwrap();

    let cluster = consumer_ctx
        .refer(&address.with_option(keys::CLUSTER, "broadcast"))
        .unwrap();
    let _: usize = cluster.invoke("hit", &()).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_context_drop_releases_port() {
    let registry = Arc::new(LocalRegistry::new("local://e2e"));
    let advertised = {
        let provider = context(&registry, config());
        provider.expose(&provider_address(), greeter()).await.unwrap()
    };
    assert!(registry.providers("com.acme.Greeter:1.0").is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        tokio::net::TcpStream::connect(advertised.authority())
            .await
            .is_err()
    );
}
