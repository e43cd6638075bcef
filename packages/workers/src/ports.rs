//! Bounded pool of worker ports.
//!
//! Kubernetes workers relay stdio over dedicated ports. The pool hands each
//! launch its ports and blocks further launches once every port is in use,
//! which is the back-pressure signal for "no more pods right now".

use std::collections::VecDeque;

use anyhow::{anyhow, Result};
use tokio::sync::{Mutex, Semaphore};

/// Blocking bounded queue of port numbers.
///
/// `take` suspends while the pool is empty; `release` wakes one waiter. A
/// port is owned by exactly one holder between `take` and `release`.
pub struct PortPool {
    ports: Mutex<VecDeque<u16>>,
    available: Semaphore,
}

impl PortPool {
    pub fn new(ports: Vec<u16>) -> Self {
        let available = Semaphore::new(ports.len());
        Self {
            ports: Mutex::new(ports.into_iter().collect()),
            available,
        }
    }

    /// Number of ports currently available without blocking.
    pub fn available(&self) -> usize {
        self.available.available_permits()
    }

    /// Take a port, waiting until one is available.
    pub async fn take(&self) -> Result<u16> {
        let permit = self
            .available
            .acquire()
            .await
            .map_err(|_| anyhow!("port pool closed"))?;
        permit.forget();
        let port = self
            .ports
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| anyhow!("port pool empty despite permit"))?;
        Ok(port)
    }

    /// Return a port to the pool.
    pub async fn release(&self, port: u16) {
        self.ports.lock().await.push_back(port);
        self.available.add_permits(1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn takes_ports_in_order() {
        let pool = PortPool::new(vec![9001, 9002]);
        assert_eq!(pool.take().await.unwrap(), 9001);
        assert_eq!(pool.take().await.unwrap(), 9002);
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test]
    async fn take_blocks_until_release() {
        let pool = Arc::new(PortPool::new(vec![9001, 9002]));
        let p1 = pool.take().await.unwrap();
        let _p2 = pool.take().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.take().await.unwrap() })
        };

        // The third take has nothing to grab yet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.release(p1).await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, p1);
    }

    #[tokio::test]
    async fn released_port_is_not_handed_out_twice() {
        let pool = PortPool::new(vec![9001]);
        let p = pool.take().await.unwrap();
        pool.release(p).await;
        let again = pool.take().await.unwrap();
        assert_eq!(again, p);
        assert_eq!(pool.available(), 0);
    }
}
