//! Property tests for the kernel invariants: FIFO dispatch, priority
//! ordering, cache coherence, completion arithmetic and value finality.
use axon::parking_lot::Mutex;
use axon::prelude::*;
use proptest::prelude::*;
use std::collections::HashMap;

fn settle(app: &mut Manager) {
    for _ in 0..256 {
        if app.queued() == 0 && app.pending_tasks() == 0 {
            return;
        }
        app.tick(None);
    }
    panic!("tree did not settle");
}

proptest! {
    /// For a single producer, handlers observe events in enqueue order.
    #[test]
    fn fifo_per_producer(names in prop::collection::vec("[a-d]{1,4}", 1..24)) {
        let mut app = Manager::new("app");
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let log = log.clone();
            app.add_handler(Handler::wildcard(move |_ctx, event: &Arc<Event>| {
                log.lock().push(event.name().to_owned());
                Ok(Outcome::Pass)
            }));
        }

        for name in &names {
            app.fire(Event::new(name.clone()));
        }
        settle(&mut app);

        prop_assert_eq!(&*log.lock(), &names);
    }

    /// Handler call order equals the stable sort by (priority desc,
    /// filter desc).
    #[test]
    fn priority_then_filter_ordering(
        specs in prop::collection::vec((-10..10i32, any::<bool>()), 1..12)
    ) {
        let mut app = Manager::new("app");
        let log: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

        for (index, (priority, filter)) in specs.iter().enumerate() {
            let log = log.clone();
            app.add_handler(
                Handler::new("evt", move |_ctx, _event| {
                    log.lock().push(index);
                    Ok(Outcome::Pass)
                })
                .priority(f64::from(*priority))
                .filter(*filter),
            );
        }

        app.fire(Event::new("evt"));
        settle(&mut app);

        let mut expected: Vec<usize> = (0..specs.len()).collect();
        expected.sort_by(|a, b| {
            specs[*b]
                .0
                .cmp(&specs[*a].0)
                .then(specs[*b].1.cmp(&specs[*a].1))
        });
        prop_assert_eq!(&*log.lock(), &expected);
    }

    /// After arbitrary registry mutations, dispatch order for a cached key
    /// equals a cache-bypassed recomputation.
    #[test]
    fn cache_coherent_after_mutations(
        ops in prop::collection::vec((0..3usize, any::<bool>(), -5..5i32), 1..16)
    ) {
        let mut app = Manager::new("app");
        let channels = vec![Channel::Any, Channel::from("alpha")];
        let log: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let mut label_of: HashMap<HandlerId, usize> = HashMap::new();
        let mut ids: Vec<HandlerId> = Vec::new();

        for (label, (kind, on_alpha, priority)) in ops.iter().enumerate() {
            // dispatch once so the key is cached before the next mutation
            app.fire_to(Event::new("evt"), &channels);
            settle(&mut app);

            if *kind == 2 {
                if let Some(id) = ids.pop() {
                    app.remove_handler(id, Some("evt"));
                }
            } else {
                let log = log.clone();
                let channel = if *on_alpha { Channel::from("alpha") } else { Channel::Any };
                let id = app.add_handler(
                    Handler::new("evt", move |_ctx, _event| {
                        log.lock().push(label);
                        Ok(Outcome::Pass)
                    })
                    .channel(channel)
                    .priority(f64::from(*priority)),
                );
                label_of.insert(id, label);
                ids.push(id);
            }
        }

        let fresh = app.matching_handlers(&Event::new("evt"), &channels);

        log.lock().clear();
        app.fire_to(Event::new("evt"), &channels);
        settle(&mut app);

        let expected: Vec<usize> = fresh.iter().map(|id| label_of[id]).collect();
        prop_assert_eq!(&*log.lock(), &expected);
    }

    /// For any event with complete=true, the complete notice fires exactly
    /// once, after every transitively fired event was handled.
    #[test]
    fn completion_arithmetic(depth in 1usize..6) {
        let mut app = Manager::new("app");
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        for level in 0..depth {
            let log = log.clone();
            let next = format!("lvl{}", level + 1);
            let fires_next = level + 1 < depth;
            app.add_handler(Handler::new(&format!("lvl{level}"), move |ctx, _event| {
                log.lock().push(format!("lvl{level}"));
                if fires_next {
                    ctx.fire(Event::new(next.clone()));
                }
                Ok(Outcome::Pass)
            }));
        }
        {
            let log = log.clone();
            app.add_handler(Handler::new("lvl0_complete", move |_ctx, _event| {
                log.lock().push("complete".into());
                Ok(Outcome::Pass)
            }));
        }

        app.fire(Event::new("lvl0").complete(true));
        settle(&mut app);

        let recorded = log.lock().clone();
        prop_assert_eq!(recorded.iter().filter(|s| *s == "complete").count(), 1);

        let deepest = format!("lvl{}", depth - 1);
        let deepest_at = recorded.iter().position(|s| s == &deepest).unwrap();
        let complete_at = recorded.iter().position(|s| s == "complete").unwrap();
        prop_assert!(complete_at > deepest_at, "complete too early: {recorded:?}");
    }

    /// The final value is the last non-null handler return; errors stick.
    #[test]
    fn value_finality(
        returns in prop::collection::vec(prop::option::of(0..100i32), 1..10),
        with_fault in any::<bool>()
    ) {
        let mut app = Manager::new("app");
        if with_fault {
            app.add_handler(
                Handler::new("evt", |_ctx, _event| Err("boom".into())).priority(100.0),
            );
        }
        for (index, ret) in returns.iter().enumerate() {
            let ret = *ret;
            app.add_handler(
                Handler::new("evt", move |_ctx, _event| {
                    Ok(match ret {
                        Some(v) => Outcome::value(v),
                        None => Outcome::Pass,
                    })
                })
                .priority(-(index as f64)),
            );
        }

        let value = app.fire(Event::new("evt"));
        settle(&mut app);

        if let Some(expected) = returns.iter().rev().find_map(|r| *r) {
            prop_assert_eq!(
                value.get().and_then(|p| p.downcast_ref::<i32>().copied()),
                Some(expected)
            );
        }
        prop_assert_eq!(value.errors(), with_fault);
    }
}
