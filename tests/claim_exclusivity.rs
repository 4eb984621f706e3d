//! Property: a path never has more than one unreleased claim, however
//! acquires and releases from competing agents interleave.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use proptest::prelude::*;

use foreman::claims::FileClaimManager;
use foreman::error::ErrorKind;
use foreman::store::{Database, LibSqlBackend};

const AGENTS: [&str; 3] = ["alpha", "beta", "gamma"];
const PATHS: [&str; 3] = ["src/lib.rs", "./src/main.rs", "README.md"];

#[derive(Debug, Clone)]
enum Op {
    Acquire { agent: usize, path: usize },
    Release { agent: usize, path: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..AGENTS.len(), 0..PATHS.len()).prop_map(|(agent, path)| Op::Acquire { agent, path }),
        1 => (0..AGENTS.len(), 0..PATHS.len()).prop_map(|(agent, path)| Op::Release { agent, path }),
    ]
}

async fn apply(claims: &FileClaimManager, op: &Op) {
    match *op {
        Op::Acquire { agent, path } => {
            if let Err(e) = claims.acquire(AGENTS[agent], PATHS[path]).await {
                assert_eq!(e.kind(), ErrorKind::Conflict, "unexpected error: {e}");
            }
        }
        Op::Release { agent, path } => {
            if let Err(e) = claims.release(AGENTS[agent], PATHS[path]).await {
                assert_eq!(e.kind(), ErrorKind::NotFound, "unexpected error: {e}");
            }
        }
    }
}

async fn assert_exclusive(db: &Arc<dyn Database>) {
    let mut holders: HashMap<String, Vec<String>> = HashMap::new();
    for claim in db.list_active_claims().await.unwrap() {
        holders.entry(claim.file_path).or_default().push(claim.agent_id);
    }
    for (path, agents) in holders {
        assert_eq!(agents.len(), 1, "{path} held by {agents:?}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn at_most_one_unreleased_claim_per_path(batches in prop::collection::vec(prop::collection::vec(op(), 1..6), 1..8)) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
            let claims = FileClaimManager::new(Arc::clone(&db));

            for batch in &batches {
                let tasks = batch.iter().cloned().map(|op| {
                    let claims = claims.clone();
                    tokio::spawn(async move { apply(&claims, &op).await })
                });
                for joined in join_all(tasks).await {
                    joined.unwrap();
                }
                assert_exclusive(&db).await;
            }
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_agents_get_exactly_one_winner() {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let claims = FileClaimManager::new(Arc::clone(&db));

    let attempts = (0..16).map(|i| {
        let claims = claims.clone();
        tokio::spawn(async move { claims.acquire(&format!("agent-{i}"), "shared/config.toml").await })
    });
    let winners = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .filter(|result| result.is_ok())
        .count();

    assert_eq!(winners, 1);
    assert_eq!(db.list_active_claims().await.unwrap().len(), 1);
}
