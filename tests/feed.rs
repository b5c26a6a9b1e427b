extern crate env_logger;
extern crate flowmark;
extern crate futures;

mod support;

use std::sync::Arc;

use futures::Future;

use flowmark::{get_metadata, Config, Filter, Identity, Registry};
use flowmark::feed::{self, Update};
use flowmark::policy::PolicyInstance;

use support::MockSocket;

fn egress_filter(registry: &Registry) -> Arc<Filter> {
    let config = Config {
        is_ingress: false,
        may_use_original_source_address: false,
        egress_mark_source_endpoint_id: false,
        no_local_enforcement: false,
        store_root: None,
    };
    Arc::new(Filter::new(&config, registry, None).expect("filter"))
}

#[test]
fn updates_become_visible_to_filters() {
    support::init();
    let registry = Registry::new();
    let filter = egress_filter(&registry);
    let (feeder, task) = feed::new(&registry);

    feeder.send(Update::Policy(
        "10.0.0.5".to_string(),
        PolicyInstance::new("", 0),
    ));
    feeder.send(Update::Host("10.0.0.5".parse().unwrap(), Identity::new(42)));
    drop(feeder);
    task.wait().unwrap();

    let mut socket = MockSocket::new("10.0.0.5:33000", "10.0.0.9:80");
    filter.resolve_metadata(&mut socket).unwrap();

    let meta = get_metadata(&socket).unwrap();
    assert_eq!(meta.identity(), Identity::new(42));
    assert_eq!(meta.mark(), 0x002a_0b00);
}

#[test]
fn removals_take_effect_in_order() {
    support::init();
    let registry = Registry::new();
    let filter = egress_filter(&registry);
    let (feeder, task) = feed::new(&registry);

    feeder.send(Update::Policy(
        "10.0.0.5".to_string(),
        PolicyInstance::new("", 0),
    ));
    feeder.send(Update::Host("10.0.0.5".parse().unwrap(), Identity::new(42)));
    feeder.send(Update::RemoveHost("10.0.0.5".parse().unwrap()));
    feeder.send(Update::RemovePolicy("10.0.0.5".to_string()));
    drop(feeder);
    task.wait().unwrap();

    let mut socket = MockSocket::new("10.0.0.5:33000", "10.0.0.9:80");
    assert!(filter.resolve_metadata(&mut socket).is_err());
    assert!(get_metadata(&socket).is_none());
}

#[test]
fn a_held_policy_survives_its_removal() {
    support::init();
    let registry = Registry::new();
    let filter = egress_filter(&registry);
    let (feeder, task) = feed::new(&registry);

    feeder.send(Update::Policy(
        "10.0.0.5".to_string(),
        PolicyInstance::new("ct-a", 1),
    ));
    drop(feeder);
    task.wait().unwrap();

    let mut socket = MockSocket::new("10.0.0.5:33000", "10.0.0.9:80");
    filter.resolve_metadata(&mut socket).unwrap();
    let meta = get_metadata(&socket).unwrap();
    assert_eq!(meta.current_policy().unwrap().conntrack_name(), "ct-a");

    // Remove the policy after the connection was accepted.
    let (feeder, task) = feed::new(&registry);
    feeder.send(Update::RemovePolicy("10.0.0.5".to_string()));
    drop(feeder);
    task.wait().unwrap();

    // The accept-time instance stays available, but re-resolution sees
    // the live store and reports the pod is gone.
    assert_eq!(meta.initial_policy().conntrack_name(), "ct-a");
    assert!(meta.current_policy().is_none());
}
