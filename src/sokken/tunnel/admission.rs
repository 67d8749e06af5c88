use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// Connection-count budget shared by every relay session of the process.
///
/// A slot is taken with [`Admission::try_admit`] and handed back when the returned
/// [`AdmissionPermit`] is dropped, so every exit path of a session releases it
/// exactly once.
#[derive(Debug)]
pub struct Admission {
    active: AtomicUsize,
    max: usize,
}

impl Admission {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max,
        })
    }

    /// Reserves one slot if the count is below the maximum.
    ///
    /// A rejection leaves the count untouched.
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let admitted = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            });

        match admitted {
            Ok(prev) => {
                metrics::counter!("sokken_connections_total").increment(1);
                metrics::gauge!("sokken_active_connections").set((prev + 1) as f64);
                Some(AdmissionPermit {
                    admission: self.clone(),
                })
            }
            Err(_) => {
                metrics::counter!("sokken_rejected_total", "reason" => "capacity").increment(1);
                None
            }
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// `(active, max)` read in one go, for health reporting.
    pub fn snapshot(&self) -> (usize, usize) {
        (self.active(), self.max)
    }

    fn release(&self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "admission released more often than admitted");
        metrics::gauge!("sokken_active_connections").set(prev.saturating_sub(1) as f64);
    }
}

/// One reserved slot of an [`Admission`] budget.
#[derive(Debug)]
pub struct AdmissionPermit {
    admission: Arc<Admission>,
}

impl AdmissionPermit {
    /// Active count including this permit's own slot.
    pub fn active(&self) -> usize {
        self.admission.active()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.admission.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_max_then_rejects() {
        let adm = Admission::new(2);
        let a = adm.try_admit().expect("first");
        let b = adm.try_admit().expect("second");
        assert_eq!(adm.active(), 2);

        assert!(adm.try_admit().is_none());
        assert_eq!(adm.active(), 2, "rejection must not change the count");

        drop(a);
        assert_eq!(adm.active(), 1);
        let c = adm.try_admit().expect("slot freed by drop");
        assert_eq!(c.active(), 2);

        drop(b);
        drop(c);
        assert_eq!(adm.snapshot(), (0, 2));
    }

    #[test]
    fn zero_budget_rejects_everything() {
        let adm = Admission::new(0);
        assert!(adm.try_admit().is_none());
        assert_eq!(adm.active(), 0);
    }

    #[test]
    fn permit_released_on_early_return() {
        fn session(adm: &Arc<Admission>, fail: bool) -> Result<(), &'static str> {
            let _permit = adm.try_admit().ok_or("full")?;
            if fail {
                return Err("dial failed");
            }
            Ok(())
        }

        let adm = Admission::new(1);
        assert!(session(&adm, true).is_err());
        assert_eq!(adm.active(), 0);
        assert!(session(&adm, false).is_ok());
        assert_eq!(adm.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sessions_never_exceed_max() {
        const MAX: usize = 5;
        let adm = Admission::new(MAX);
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..200 {
            let adm = adm.clone();
            let peak = peak.clone();
            tasks.spawn(async move {
                let Some(permit) = adm.try_admit() else {
                    return false;
                };
                peak.fetch_max(permit.active(), Ordering::AcqRel);
                tokio::task::yield_now().await;
                true
            });
        }

        let mut admitted = 0;
        while let Some(res) = tasks.join_next().await {
            if res.unwrap() {
                admitted += 1;
            }
        }

        assert!(admitted >= 1);
        assert!(peak.load(Ordering::Acquire) <= MAX);
        assert_eq!(adm.active(), 0);
    }
}
