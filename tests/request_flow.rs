use async_trait::async_trait;
use clinic_chat_runtime::cache::{
    CacheBackend, CacheEntry, CacheKey, Category, InvalidationFilter, RejectReason, StoreOutcome,
};
use clinic_chat_runtime::gateway::{ChatGateway, ChatRequest, Generated, ResponseSource};
use clinic_chat_runtime::resilience::circuit_breaker::CircuitState;
use clinic_chat_runtime::resilience::retry::RetryPolicy;
use clinic_chat_runtime::{
    CacheContext, ConnectionFactory, Error, Priority, RateWindowKind, Result, RuntimeConfig,
};
use futures::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CATARACT_QUESTION: &str = "Quais são os sintomas de catarata?";
const CATARACT_ANSWER: &str = "Os sintomas mais comuns de catarata são visão embaçada, \
sensibilidade à luz e dificuldade para enxergar à noite. Procure um oftalmologista para avaliação.";

struct ModelConn;

struct ModelFactory;

#[async_trait]
impl ConnectionFactory for ModelFactory {
    type Connection = ModelConn;

    async fn open(&self) -> Result<ModelConn> {
        Ok(ModelConn)
    }
}

fn gateway(cfg: RuntimeConfig) -> ChatGateway<ModelFactory> {
    ChatGateway::builder(ModelFactory).with_config(cfg).build().unwrap()
}

async fn ask(
    gw: &ChatGateway<ModelFactory>,
    request: ChatRequest,
    calls: &Arc<AtomicUsize>,
    answer: &'static str,
) -> Result<clinic_chat_runtime::ChatResponse> {
    gw.respond(request, |_conn| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok(Generated::new(answer, 120)) }.boxed()
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_repeated_question_is_answered_from_cache() {
    let gw = gateway(RuntimeConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let first = ask(&gw, ChatRequest::new("ip-1", "s-1", CATARACT_QUESTION), &calls, CATARACT_ANSWER)
        .await
        .unwrap();
    assert_eq!(first.source, ResponseSource::Generated);
    assert_eq!(first.tokens_used, 120);
    assert!(matches!(
        first.cache_outcome,
        Some(StoreOutcome::Stored { category: Category::Cataract, .. })
    ));

    // different punctuation and case normalize to the same key
    let second = ask(&gw, ChatRequest::new("ip-2", "s-2", "quais são os SINTOMAS de catarata"), &calls, CATARACT_ANSWER)
        .await
        .unwrap();
    assert!(second.from_cache());
    assert_eq!(second.text, CATARACT_ANSWER);
    assert_eq!(second.tokens_used, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stats = gw.cache().stats().await;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.stores, 1);
}

#[tokio::test(start_paused = true)]
async fn test_emergency_answers_are_never_cached() {
    let gw = gateway(RuntimeConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let request = || {
        ChatRequest::new("ip-1", "s-1", "Meu olho está sangrando, é urgente")
            .with_context(CacheContext::default().with_emergency_context())
            .with_priority(Priority::High)
    };

    let first = ask(&gw, request(), &calls, CATARACT_ANSWER).await.unwrap();
    assert_eq!(first.cache_outcome, Some(StoreOutcome::Rejected(RejectReason::Emergency)));
    let second = ask(&gw, request(), &calls, CATARACT_ANSWER).await.unwrap();
    assert!(!second.from_cache());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_rejects_before_any_work() {
    let mut cfg = RuntimeConfig::default();
    cfg.rate_limit = cfg.rate_limit.with_messages_per_minute(3);
    let gw = gateway(cfg);
    let calls = Arc::new(AtomicUsize::new(0));

    for i in 0..3 {
        let msg = format!("Pergunta número {i} sobre miopia");
        ask(&gw, ChatRequest::new("ip-1", "s-1", msg), &calls, CATARACT_ANSWER)
            .await
            .unwrap();
    }
    let err = ask(&gw, ChatRequest::new("ip-1", "s-1", "Outra pergunta"), &calls, CATARACT_ANSWER)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RateLimited { window: RateWindowKind::Minute, .. }));
    assert!(err.retry_after().unwrap() <= Duration::from_secs(60));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // other clients are unaffected
    ask(&gw, ChatRequest::new("ip-2", "s-2", "Outra pergunta"), &calls, CATARACT_ANSWER)
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;
    ask(&gw, ChatRequest::new("ip-1", "s-1", "Mais uma pergunta"), &calls, CATARACT_ANSWER)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_budget_exceeded_is_rejected_before_generation() {
    let mut cfg = RuntimeConfig::default();
    cfg.budget = cfg.budget.with_budget_limit(300);
    let gw = gateway(cfg);
    let calls = Arc::new(AtomicUsize::new(0));

    let first = gw
        .respond(ChatRequest::new("ip-1", "s-1", "Como tratar olho seco?"), |_conn| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Generated::new("curta", 250)) }.boxed()
        })
        .await
        .unwrap();
    assert_eq!(first.budget_remaining, 50);

    let request = ChatRequest::new("ip-1", "s-1", "E colírio lubrificante?").with_estimated_tokens(100);
    let err = ask(&gw, request, &calls, CATARACT_ANSWER).await.unwrap_err();
    assert!(matches!(
        err,
        Error::BudgetExceeded {
            used: 250,
            limit: 300,
            requested: 100
        }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // spending exactly up to the ceiling is allowed
    let request = ChatRequest::new("ip-1", "s-1", "E compressa morna?").with_estimated_tokens(50);
    assert!(ask(&gw, request, &calls, CATARACT_ANSWER).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_session_is_refused_even_for_free_requests() {
    let mut cfg = RuntimeConfig::default();
    cfg.budget = cfg.budget.with_budget_limit(100);
    let gw = gateway(cfg);
    let calls = Arc::new(AtomicUsize::new(0));

    let first = gw
        .respond(ChatRequest::new("ip-1", "s-1", "Como tratar olho seco?"), |_conn| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Generated::new("curta", 100)) }.boxed()
        })
        .await
        .unwrap();
    assert_eq!(first.budget_remaining, 0);

    let zero_estimate = ChatRequest::new("ip-1", "s-1", "E colírio?").with_estimated_tokens(0);
    let err = ask(&gw, zero_estimate, &calls, CATARACT_ANSWER).await.unwrap_err();
    assert!(matches!(
        err,
        Error::BudgetExceeded {
            used: 100,
            limit: 100,
            requested: 0
        }
    ));

    // an empty message estimates to zero tokens
    let err = ask(&gw, ChatRequest::new("ip-1", "s-1", ""), &calls, CATARACT_ANSWER)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BudgetExceeded { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // other sessions keep their own budget
    assert!(ask(&gw, ChatRequest::new("ip-1", "s-2", ""), &calls, CATARACT_ANSWER).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_fails_fast_without_taking_resources() {
    let mut cfg = RuntimeConfig::default();
    cfg.breaker = cfg.breaker.with_failure_threshold(2);
    cfg.retry = RetryPolicy::no_retry();
    let gw = gateway(cfg);
    let calls = Arc::new(AtomicUsize::new(0));

    let failing = |gw: ChatGateway<ModelFactory>, calls: Arc<AtomicUsize>, msg: &'static str| async move {
        gw.respond(ChatRequest::new("ip-1", "s-1", msg), |_conn| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::dependency("model unavailable")) }.boxed()
        })
        .await
    };

    for msg in ["Glaucoma tem cura?", "Glaucoma é hereditário?"] {
        let err = failing(gw.clone(), calls.clone(), msg).await.unwrap_err();
        assert!(matches!(err, Error::Dependency { .. }));
    }
    let status = gw.status().await;
    assert_eq!(status.breakers["gemini"].state, CircuitState::Open);
    let created = status.pool.created;
    let failed = status.admission.failed;

    let err = failing(gw.clone(), calls.clone(), "Glaucoma dói?").await.unwrap_err();
    assert!(matches!(err, Error::DependencyOpen { ref dependency } if dependency == "gemini"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let status = gw.status().await;
    assert_eq!(status.pool.created, created);
    assert_eq!(status.admission.failed, failed);
    let recs = status.recommendations();
    assert!(recs.iter().any(|r| r.category == "circuit_breaker"));

    tokio::time::advance(Duration::from_secs(61)).await;
    ask(&gw, ChatRequest::new("ip-1", "s-1", "Glaucoma dói?"), &calls, CATARACT_ANSWER)
        .await
        .unwrap();
    assert_eq!(gw.status().await.breakers["gemini"].state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_with_backoff() {
    let gw = gateway(RuntimeConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let started = tokio::time::Instant::now();
    let response = gw
        .respond(ChatRequest::new("ip-1", "s-1", "O que é astigmatismo?"), |_conn| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(Error::dependency("connection reset"))
                } else {
                    Ok(Generated::new(CATARACT_ANSWER, 90))
                }
            }
            .boxed()
        })
        .await
        .unwrap();

    assert_eq!(response.tokens_used, 90);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_secs(6));
    let breaker = &gw.status().await.breakers["gemini"];
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_high_priority_requests_jump_the_queue() {
    let mut cfg = RuntimeConfig::default();
    cfg.admission = cfg.admission.with_max_concurrent(1);
    let gw = gateway(cfg);
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let spawn = |name: &'static str, priority: Priority| {
        let gw = gw.clone();
        let order = order.clone();
        tokio::spawn(async move {
            let request = ChatRequest::new(name, name, format!("Pergunta de {name}")).with_priority(priority);
            gw.respond(request, |_conn| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(name);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(Generated::new("ok", 1))
                }
                .boxed()
            })
            .await
        })
    };

    let first = spawn("first", Priority::Normal);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let normal = spawn("normal", Priority::Normal);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let high = spawn("high", Priority::High);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(gw.admission().queue_len(), 2);

    for t in [first, normal, high] {
        t.await.unwrap().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["first", "high", "normal"]);
}

struct OfflineStore;

#[async_trait]
impl CacheBackend for OfflineStore {
    async fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>> {
        Err(Error::dependency("cache store offline"))
    }
    async fn put(&self, _entry: CacheEntry) -> Result<()> {
        Err(Error::dependency("cache store offline"))
    }
    async fn remove(&self, _key: &CacheKey) -> Result<bool> {
        Err(Error::dependency("cache store offline"))
    }
    async fn entries_in_category(&self, _category: Category) -> Result<Vec<CacheEntry>> {
        Err(Error::dependency("cache store offline"))
    }
    async fn entries(&self) -> Result<Vec<CacheEntry>> {
        Err(Error::dependency("cache store offline"))
    }
    async fn remove_matching(&self, _filter: &InvalidationFilter) -> Result<Vec<CacheKey>> {
        Err(Error::dependency("cache store offline"))
    }
    async fn purge_expired(&self) -> Result<usize> {
        Err(Error::dependency("cache store offline"))
    }
    async fn clear(&self) -> Result<()> {
        Err(Error::dependency("cache store offline"))
    }
    async fn len(&self) -> Result<usize> {
        Err(Error::dependency("cache store offline"))
    }
    fn name(&self) -> &'static str {
        "offline"
    }
}

#[tokio::test(start_paused = true)]
async fn test_cache_outage_degrades_to_generation() {
    let gw = ChatGateway::builder(ModelFactory)
        .with_durable_cache(Box::new(OfflineStore))
        .build()
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let response = ask(&gw, ChatRequest::new("ip-1", "s-1", CATARACT_QUESTION), &calls, CATARACT_ANSWER)
            .await
            .unwrap();
        assert!(!response.from_cache());
        assert!(response.cache_outcome.is_none());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(gw.cache().stats().await.errors >= 2);
}
