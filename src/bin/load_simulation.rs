//! Drives a burst of simulated patient traffic through the gateway and prints
//! the resulting resource status and recommendations as JSON.
//!
//! Tunables come from the usual `CHATBOT_*` variables; log level from `RUST_LOG`.
//!
//! ```text
//! RUST_LOG=clinic_chat_runtime=debug cargo run --bin load-simulation -- 200
//! ```

use async_trait::async_trait;
use clinic_chat_runtime::gateway::{ChatGateway, ChatRequest, Generated};
use clinic_chat_runtime::{CacheContext, ConnectionFactory, Error, Priority, RuntimeConfig};
use futures::FutureExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const QUESTIONS: &[&str] = &[
    "Quais são os sintomas de catarata?",
    "Como funciona a cirurgia de catarata com lente intraocular?",
    "Qual o horário de funcionamento da clínica?",
    "Vocês aceitam convênio Unimed?",
    "Quero agendar uma consulta com oftalmologista",
    "Glaucoma tem cura?",
    "Quanto custa o exame de fundo de olho?",
    "Onde fica a clínica?",
];

const ANSWER: &str = "Obrigado pela pergunta. Nossa equipe de oftalmologia pode orientar \
sobre sintomas, exames e tratamentos disponíveis na clínica. Para uma avaliação \
individual, recomendamos uma consulta presencial com um de nossos especialistas.";

/// Stand-in model client: fixed latency, every `fail_every`-th call fails.
struct SimulatedModel {
    opened: AtomicU64,
    calls: AtomicU64,
    fail_every: u64,
}

struct ModelSession {
    id: u64,
}

#[async_trait]
impl ConnectionFactory for SimulatedModel {
    type Connection = ModelSession;

    async fn open(&self) -> clinic_chat_runtime::Result<ModelSession> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(ModelSession { id })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let total: usize = std::env::args()
        .nth(1)
        .and_then(|n| n.parse().ok())
        .unwrap_or(100);

    let config = RuntimeConfig::from_env();
    let gateway = ChatGateway::builder(SimulatedModel {
        opened: AtomicU64::new(0),
        calls: AtomicU64::new(0),
        fail_every: 17,
    })
    .with_config(config)
    .build()?;
    let maintenance = gateway.start().await?;

    let mut tasks = Vec::with_capacity(total);
    for i in 0..total {
        let gw = gateway.clone();
        tasks.push(tokio::spawn(async move {
            let question = QUESTIONS[i % QUESTIONS.len()];
            let mut context = CacheContext::default();
            if question.contains("agendar") {
                context = context.with_appointment_intent();
            }
            let request = ChatRequest::new(format!("client-{}", i % 12), format!("session-{}", i % 30), question)
                .with_context(context)
                .with_priority(if i % 10 == 0 { Priority::High } else { Priority::Normal });
            let factory = gw.pool().factory();
            gw.respond(request, |session| {
                let call = factory.calls.fetch_add(1, Ordering::Relaxed) + 1;
                let fail = call % factory.fail_every == 0;
                let session_id = session.id;
                async move {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    if fail {
                        return Err(Error::dependency(format!("model session {session_id} reset")));
                    }
                    Ok(Generated::new(ANSWER, 180))
                }
                .boxed()
            })
            .await
        }));
    }

    let (mut generated, mut cached, mut rejected) = (0u32, 0u32, 0u32);
    for task in tasks {
        match task.await? {
            Ok(response) if response.from_cache() => cached += 1,
            Ok(_) => generated += 1,
            Err(e) => {
                if !e.is_admission_rejection() {
                    warn!(error = %e, "request failed");
                }
                rejected += 1;
            }
        }
    }
    info!(generated, cached, rejected, "simulation finished");

    let status = gateway.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    println!("{}", serde_json::to_string_pretty(&status.recommendations())?);

    gateway.shutdown(maintenance, Duration::from_secs(30)).await;
    Ok(())
}
