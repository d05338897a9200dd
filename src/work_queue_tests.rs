//! Queue semantics: at-least-once delivery, visibility timeout,
//! scheduling, and explicit completion.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::testutil::test_env;
    use crate::work_queue::PersistentQueue;

    fn queue(store: &Arc<crate::store::IndexStore>, visibility_ms: u64) -> PersistentQueue {
        PersistentQueue::new(
            Arc::clone(store),
            "TestQueue",
            Duration::from_millis(visibility_ms),
        )
    }

    #[tokio::test]
    async fn receive_on_empty_queue_times_out() {
        let env = test_env();
        let q = queue(&env.store, 60_000);
        let got = q.receive(Duration::from_millis(150)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn send_receive_complete() {
        let env = test_env();
        let q = queue(&env.store, 60_000);

        q.send(b"alpha").unwrap();
        let msg = q.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(msg.payload, b"alpha");
        assert_eq!(msg.delivery_count, 1);
        msg.complete().unwrap();

        assert!(q.is_empty().unwrap());
    }

    #[tokio::test]
    async fn messages_are_delivered_in_send_order() {
        let env = test_env();
        let q = queue(&env.store, 60_000);
        for payload in [b"one".as_slice(), b"two", b"three"] {
            q.send(payload).unwrap();
        }
        for expected in [b"one".as_slice(), b"two", b"three"] {
            let msg = q.receive(Duration::from_secs(1)).await.unwrap().unwrap();
            assert_eq!(msg.payload, expected);
            msg.complete().unwrap();
        }
    }

    #[tokio::test]
    async fn uncompleted_message_reappears_after_visibility_timeout() {
        let env = test_env();
        let q = queue(&env.store, 200);

        q.send(b"retry-me").unwrap();
        let first = q.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(first.delivery_count, 1);
        drop(first); // consumer dies without completing

        // invisible until the timeout elapses
        assert!(q.receive(Duration::from_millis(50)).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let second = q.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(second.payload, b"retry-me");
        assert_eq!(second.delivery_count, 2);
        second.complete().unwrap();
    }

    #[tokio::test]
    async fn send_in_delays_visibility() {
        let env = test_env();
        let q = queue(&env.store, 60_000);

        q.send_in(Duration::from_millis(300), b"later").unwrap();
        assert!(q.receive(Duration::from_millis(50)).await.unwrap().is_none());
        assert_eq!(q.len().unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(350)).await;
        let msg = q.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(msg.payload, b"later");
        msg.complete().unwrap();
    }

    #[tokio::test]
    async fn reschedule_replaces_payload_and_delays() {
        let env = test_env();
        let q = queue(&env.store, 60_000);

        q.send(b"v1").unwrap();
        let msg = q.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        msg.reschedule_in(Duration::from_millis(300), b"v2").unwrap();

        assert_eq!(q.len().unwrap(), 1);
        assert!(q.receive(Duration::from_millis(50)).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(350)).await;
        let msg = q.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(msg.payload, b"v2");
        msg.complete().unwrap();
        assert!(q.is_empty().unwrap());
    }

    #[tokio::test]
    async fn queues_do_not_bleed_into_each_other() {
        let env = test_env();
        let a = queue(&env.store, 60_000);
        let b = PersistentQueue::new(Arc::clone(&env.store), "OtherQueue", Duration::from_secs(60));

        a.send(b"for-a").unwrap();
        assert!(b.receive(Duration::from_millis(50)).await.unwrap().is_none());
        let msg = a.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(msg.payload, b"for-a");
        msg.complete().unwrap();
    }
}
