// SPDX-License-Identifier: MPL-2.0

//! Deadlock avoidance for semaphore decrements.
//!
//! Every semaphore is a resource class of one [`ResourceState`] per namespace, whose
//! available units always equal the value of the semaphore. A task that decrements a
//! semaphore holds the units until it increments the semaphore again.
//!
//! A task may declare its maximum claim on the semaphores of a set (`SEM_SETCLAIM`).
//! Otherwise, the first decrement of a task in a set claims every semaphore of the set
//! up to the units it has at that time, so two tasks taking the semaphores of a set in
//! opposite orders are kept from waiting for each other. The implicit claim is skipped
//! if it would leave the state unsafe. Beyond its implicit claim, the claim of a task
//! grows on demand to cover each request exactly.
//!
//! Claims only cover the sets a task has already used; circular waits across sets are
//! avoided only between tasks that declare their claims.

use banker::{ResourceState, Units, Verdict};

use crate::{config::AvoidancePolicy, prelude::*};

struct TaskEntry {
    row: usize,
    /// The classes on which the task declared a claim.
    declared: BTreeSet<usize>,
    /// The classes claimed in full when the task first used their set.
    implicit: BTreeSet<usize>,
}

impl TaskEntry {
    fn new(row: usize) -> Self {
        Self {
            row,
            declared: BTreeSet::new(),
            implicit: BTreeSet::new(),
        }
    }

    fn has_claim(&self, class: usize) -> bool {
        self.declared.contains(&class) || self.implicit.contains(&class)
    }

    /// Claims the units present on the classes of a set without a claim yet.
    ///
    /// The claim is dropped if it makes the state unsafe, and retried by the next request.
    fn claim_set(&mut self, state: &mut ResourceState, classes: &[usize]) -> Result<()> {
        let (Some(allocation), Some(need)) = (state.allocation(self.row), state.need(self.row))
        else {
            return Ok(());
        };
        let raises: Vec<(usize, Units)> = classes
            .iter()
            .copied()
            .filter(|&class| !self.has_claim(class))
            .filter_map(|class| {
                let total = Units::try_from(state.total(class)).unwrap_or(Units::MAX);
                // Nothing to claim before the semaphore gets units.
                (total > 0).then(|| {
                    let claimed = allocation[class].saturating_add(need[class]);
                    (class, total.saturating_sub(claimed))
                })
            })
            .collect();
        if raises.is_empty() {
            return Ok(());
        }

        for &(class, units) in &raises {
            state.grow_need(self.row, class, units)?;
        }
        if state.is_safe() {
            self.implicit.extend(raises.iter().map(|&(class, _)| class));
            return Ok(());
        }
        for &(class, units) in &raises {
            state.shrink_need(self.row, class, units)?;
        }
        Ok(())
    }
}

struct AvoidanceInner {
    state: ResourceState,
    tasks: BTreeMap<Pid, TaskEntry>,
    /// The semaphore sets with operations blocked by an unsafe verdict.
    unsafe_blocked: BTreeSet<i32>,
}

/// The deadlock-avoidance state of an IPC namespace.
pub struct Avoidance {
    policy: AvoidancePolicy,
    inner: SpinLock<AvoidanceInner>,
}

impl Avoidance {
    pub fn new(policy: AvoidancePolicy) -> Self {
        Self {
            policy,
            inner: SpinLock::new(AvoidanceInner {
                state: ResourceState::new(),
                tasks: BTreeMap::new(),
                unsafe_blocked: BTreeSet::new(),
            }),
        }
    }

    pub fn is_enforced(&self) -> bool {
        self.policy == AvoidancePolicy::Enforce
    }

    /// Allocates one resource class per semaphore of a new set.
    ///
    /// Returns no class if avoidance is bypassed.
    pub fn register_classes(&self, nsems: usize) -> Box<[usize]> {
        if !self.is_enforced() {
            return Box::new([]);
        }

        let mut inner = self.inner.lock();
        (0..nsems).map(|_| inner.state.add_class(0)).collect()
    }

    /// Frees the resource classes of a removed set.
    ///
    /// The units held by tasks vanish with the classes.
    pub fn unregister_classes(&self, classes: &[usize]) {
        if classes.is_empty() {
            return;
        }

        let mut inner = self.inner.lock();
        for &class in classes {
            if let Err(err) = inner.state.remove_class(class) {
                warn!("[avoidance] failed to remove class {}: {:?}", class, err);
            }
        }
        for entry in inner.tasks.values_mut() {
            for class in classes {
                entry.declared.remove(class);
                entry.implicit.remove(class);
            }
        }
    }

    /// Overwrites the available units of a class after a value was set directly.
    pub fn sync_value(&self, class: usize, value: i32) {
        let mut inner = self.inner.lock();
        if let Err(err) = inner.state.set_available(class, value as Units) {
            warn!("[avoidance] failed to sync class {}: {:?}", class, err);
        }
    }

    /// Evaluates the decrements `request` of `pid` on the set `semid`, as
    /// `(index in the set, units)` pairs.
    ///
    /// A [`Verdict::Safe`] request has been granted. A refused request marks the set as
    /// blocked in the same critical section, so a concurrent release cannot miss it.
    pub fn acquire(
        &self,
        semid: i32,
        pid: Pid,
        classes: &[usize],
        request: &[(usize, Units)],
    ) -> Result<Verdict> {
        if !self.is_enforced() || request.is_empty() {
            return Ok(Verdict::Safe);
        }

        let mut inner = self.inner.lock();
        let AvoidanceInner {
            state,
            tasks,
            unsafe_blocked,
        } = &mut *inner;
        let entry = tasks
            .entry(pid)
            .or_insert_with(|| TaskEntry::new(state.add_task()));
        entry.claim_set(state, classes)?;

        let mut request_vector = vec![0; state.nr_classes()];
        for &(sem_num, units) in request {
            request_vector[classes[sem_num]] += units;
        }

        let need = state.need(entry.row).map(<[Units]>::to_vec).unwrap_or_default();
        let mut grown = Vec::new();
        for (class, (&units, &need)) in request_vector.iter().zip(&need).enumerate() {
            if units > need && !entry.declared.contains(&class) {
                state.grow_need(entry.row, class, units - need)?;
                grown.push((class, units - need));
            }
        }

        let verdict = state.evaluate(&request_vector, entry.row);
        if verdict != Verdict::Safe {
            for (class, units) in grown {
                state.shrink_need(entry.row, class, units)?;
            }
        }
        if matches!(verdict, Verdict::Wait | Verdict::WaitUnsafe) {
            debug!(
                "[avoidance] semid = {}, pid = {}, request = {:?}: {:?}",
                semid, pid, request, verdict
            );
            unsafe_blocked.insert(semid);
        }
        Ok(verdict)
    }

    /// Increments a class on behalf of `pid`.
    ///
    /// Units held by `pid` are returned first; the rest is new supply.
    pub fn release(&self, pid: Pid, class: usize, units: Units) -> Result<()> {
        if !self.is_enforced() {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        let AvoidanceInner { state, tasks, .. } = &mut *inner;

        let mut returned = 0;
        if let Some(entry) = tasks.get(&pid) {
            let held = state
                .allocation(entry.row)
                .map_or(0, |allocation| allocation[class]);
            returned = held.min(units);
            if returned > 0 {
                let mut units_vector = vec![0; state.nr_classes()];
                units_vector[class] = returned;
                state.release(entry.row, &units_vector)?;
                if !entry.has_claim(class) {
                    state.shrink_need(entry.row, class, returned)?;
                }
            }
        }

        if units > returned {
            state.supply(class, units - returned)?;
        }
        Ok(())
    }

    /// Declares the maximum claim of `pid` on `classes`.
    pub fn declare_claim(&self, pid: Pid, classes: &[usize], claim: &[Units]) -> Result<()> {
        if !self.is_enforced() {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        let AvoidanceInner { state, tasks, .. } = &mut *inner;
        let entry = tasks
            .entry(pid)
            .or_insert_with(|| TaskEntry::new(state.add_task()));

        let allocation = state.allocation(entry.row).unwrap_or_default();
        let need = state.need(entry.row).unwrap_or_default();
        let mut max_claim: Vec<Units> = allocation.iter().zip(need).map(|(a, n)| a + n).collect();
        for (&class, &units) in classes.iter().zip(claim) {
            max_claim[class] = units;
        }

        state.declare_claim(entry.row, &max_claim)?;
        for &class in classes {
            entry.declared.insert(class);
            entry.implicit.remove(&class);
        }
        Ok(())
    }

    /// Forgets an exiting task. The units it holds are consumed.
    pub fn retire_task(&self, pid: Pid) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.tasks.remove(&pid) else {
            return;
        };
        if let Err(err) = inner.state.remove_task(entry.row) {
            warn!("[avoidance] failed to retire pid {}: {:?}", pid, err);
        }
    }

    /// Takes the sets that have operations blocked by an unsafe verdict.
    pub fn take_unsafe_blocked(&self) -> BTreeSet<i32> {
        core::mem::take(&mut self.inner.lock().unsafe_blocked)
    }

    /// Returns whether the current state is safe.
    pub fn is_safe(&self) -> bool {
        self.inner.lock().state.is_safe()
    }

    /// Returns the available units of a live class.
    pub fn available(&self, class: usize) -> Option<Units> {
        let inner = self.inner.lock();
        inner
            .state
            .is_class(class)
            .then(|| inner.state.available()[class])
    }

    pub fn allocation(&self, pid: Pid, class: usize) -> Units {
        let inner = self.inner.lock();
        inner
            .tasks
            .get(&pid)
            .and_then(|entry| inner.state.allocation(entry.row))
            .map_or(0, |allocation| allocation[class])
    }

    pub fn need(&self, pid: Pid, class: usize) -> Units {
        let inner = self.inner.lock();
        inner
            .tasks
            .get(&pid)
            .and_then(|entry| inner.state.need(entry.row))
            .map_or(0, |need| need[class])
    }

    /// Runs `f` on the raw state, e.g., to compare it with a reference model.
    pub fn inspect<R>(&self, f: impl FnOnce(&ResourceState) -> R) -> R {
        f(&self.inner.lock().state)
    }
}

impl Debug for Avoidance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Avoidance")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
