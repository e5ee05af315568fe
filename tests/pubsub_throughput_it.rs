//! End-to-end scenario 6 of `spec.md` §8: a pub/sub throughput
//! regression sentinel, not a correctness test. Ignored by default
//! since it is a timing-sensitive benchmark rather than part of the
//! ordinary fast test suite; run explicitly with
//! `cargo test --test pubsub_throughput_it -- --ignored`.

use std::time::{Duration, Instant};

use cosim_core::model::{Endpoint, ScalarValue, SlaveID, StepID, Variable, VariableID};
use cosim_core::pubsub::{Publisher, Subscriber};

const VARIABLE_COUNT: u32 = 5_000;
const STEP_COUNT: i32 = 50;
const MIN_THROUGHPUT_PER_SEC: f64 = 50_000.0;

#[ignore]
#[tokio::test]
async fn subscriber_sustains_minimum_throughput_across_many_variables() {
    let publisher = Publisher::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = publisher.local_addr();

    let mut subscriber = Subscriber::new();
    let variables: Vec<Variable> = (0..VARIABLE_COUNT)
        .map(|i| Variable::new(SlaveID(1), VariableID(i)))
        .collect();
    for &variable in &variables {
        subscriber.subscribe(variable);
    }
    subscriber
        .set_peers(&[Endpoint::tcp(addr.to_string())])
        .await
        .unwrap();
    // Let the publisher's accept loop register the fresh connection
    // before any values are published.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    for step in 0..STEP_COUNT {
        let step_id = StepID(step);
        for &variable in &variables {
            publisher.publish(step_id, variable, &ScalarValue::Real(step as f64));
        }
        let filled = subscriber
            .update(step_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(filled, "subscriber failed to observe every variable by step {step}");
    }
    let elapsed = start.elapsed();

    let total_values = VARIABLE_COUNT as f64 * STEP_COUNT as f64;
    let throughput = total_values / elapsed.as_secs_f64();
    println!("pub/sub throughput: {throughput:.0} var-values/sec over {elapsed:?}");
    assert!(
        throughput >= MIN_THROUGHPUT_PER_SEC,
        "throughput {throughput:.0} var-values/sec fell below the {MIN_THROUGHPUT_PER_SEC:.0} floor"
    );
}
