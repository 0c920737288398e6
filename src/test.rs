#![cfg(test)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::executor;

use crate::QueryScheduler;

fn keys(list: &[&str]) -> HashSet<String> {
    list.iter().map(|key| key.to_string()).collect()
}

async fn stringify(keys: HashSet<String>) -> Result<HashMap<String, String>, ()> {
    Ok(keys
        .into_iter()
        .map(|key| {
            let value = key.to_uppercase();
            (key, value)
        })
        .collect())
}

fn call_counter<'a, T, R>(
    counter: &'a AtomicUsize,
    function: impl Fn(T) -> R + 'a,
) -> impl Fn(T) -> R + 'a {
    move |argument| {
        counter.fetch_add(1, Ordering::SeqCst);
        function(argument)
    }
}

#[test]
fn single_query() {
    let counter = AtomicUsize::new(0);
    let scheduler = QueryScheduler::new(call_counter(&counter, stringify));

    let response = executor::block_on(scheduler.query(keys(&["alice"]))).unwrap();

    assert_eq!(response, HashMap::from([("alice".into(), "ALICE".into())]));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn duplicate_queries_share_a_wave() {
    let counter = AtomicUsize::new(0);
    let scheduler = QueryScheduler::new(call_counter(&counter, stringify));

    let fut1 = scheduler.query(keys(&["alice"]));
    let fut2 = scheduler.query(keys(&["alice"]));
    let fut3 = scheduler.query(keys(&["alice"]));

    let res1 = executor::block_on(fut1).unwrap();
    let res2 = executor::block_on(fut2).unwrap();
    let res3 = executor::block_on(fut3).unwrap();

    let expected = HashMap::from([("alice".to_string(), "ALICE".to_string())]);
    assert_eq!(res1, expected);
    assert_eq!(res2, expected);
    assert_eq!(res3, expected);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn subset_rides_the_in_flight_wave() {
    let counter = AtomicUsize::new(0);
    let scheduler = QueryScheduler::new(call_counter(&counter, stringify));

    let fut1 = scheduler.query(keys(&["alice", "bob"]));
    let fut2 = scheduler.query(keys(&["bob"]));

    let res1 = executor::block_on(fut1).unwrap();
    let res2 = executor::block_on(fut2).unwrap();

    assert_eq!(
        res1,
        HashMap::from([
            ("alice".into(), "ALICE".into()),
            ("bob".into(), "BOB".into()),
        ])
    );
    // The rider's response is restricted to its own request.
    assert_eq!(res2, HashMap::from([("bob".into(), "BOB".into())]));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn empty_request_short_circuits() {
    let counter = AtomicUsize::new(0);
    let scheduler = QueryScheduler::new(call_counter(&counter, stringify));

    let response = executor::block_on(scheduler.query(HashSet::new())).unwrap();

    assert!(response.is_empty());
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}
