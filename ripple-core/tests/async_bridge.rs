//! Integration Tests for the tokio bridge

use std::time::Duration;

use ripple_core::{PromiseState, Runtime};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn promise_feeds_a_derived_value() {
    let rt = Runtime::new();
    let user = rt.spawn_promise(async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok::<_, std::io::Error>("ada".to_string())
    });
    let greeting = {
        let user = user.clone();
        rt.derive(move |r| {
            Ok(match user.read(r)? {
                PromiseState::Pending => "loading".to_string(),
                PromiseState::Resolved(name) => format!("hello {name}"),
                PromiseState::Rejected(err) => format!("error: {err}"),
            })
        })
    };
    let _hot = rt.keep_observed(&greeting).unwrap();
    assert_eq!(greeting.get().unwrap(), "loading");

    let text = rt.wait_for(&greeting, |g| g != "loading").await.unwrap();
    assert_eq!(text, "hello ada");
    assert_eq!(greeting.get().unwrap(), "hello ada");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_for_across_tasks() {
    let rt = Runtime::new();
    let progress = rt.value(0u8);

    let producer = {
        let progress = progress.clone();
        tokio::spawn(async move {
            for step in 1..=10 {
                progress.set(step * 10).unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let done = rt.wait_for(&progress, |p| *p == 100).await.unwrap();
    assert_eq!(done, 100);
    producer.await.unwrap();
    assert_eq!(rt.live_reaction_count(), 0);
}
