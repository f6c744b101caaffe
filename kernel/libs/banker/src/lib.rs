// SPDX-License-Identifier: MPL-2.0

//! Deadlock avoidance with the banker's algorithm.
//!
//! A [`ResourceState`] tracks, for every resource class, how many units are
//! currently available, and for every task, how many units of each class it
//! holds (the allocation) and how many more it may still ask for (the need).
//! The sum of the allocation and the need of a task is its maximum claim.
//!
//! [`ResourceState::evaluate`] decides whether a request can be granted
//! without leaving the system in an unsafe state, i.e., a state from which no
//! order of task completions exists. A granted request is committed; a refused
//! one leaves the state untouched.
//!
//! Both tasks and resource classes are addressed by small integer indices.
//! Indices of removed tasks and classes are recycled, lowest first.
//!
//! # Example
//!
//! ```rust
//! use banker::{ResourceState, Verdict};
//!
//! let mut state = ResourceState::new();
//! let printer = state.add_class(1);
//! let task = state.add_task();
//! state.declare_claim(task, &[1]).unwrap();
//!
//! let mut request = [0; 1];
//! request[printer] = 1;
//! assert_eq!(state.evaluate(&request, task), Verdict::Safe);
//! assert_eq!(state.available(), &[0]);
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

use alloc::{vec, vec::Vec};

/// The count type of resource units.
pub type Units = u32;

/// The outcome of evaluating a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The request is granted and the state is committed.
    Safe,
    /// Some requested units are not available right now.
    Wait,
    /// The units are available, but granting them could lead to a deadlock.
    WaitUnsafe,
    /// The task asks for more than its remaining declared need.
    Error,
}

/// Errors for bookkeeping operations that do not go through [`Verdict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankerError {
    /// The task index does not refer to a live task.
    NoSuchTask,
    /// The class index does not refer to a live resource class.
    NoSuchClass,
    /// A claim lower than what the task already holds.
    ClaimBelowAllocation,
    /// A release of more units than the task holds.
    ExcessRelease,
    /// A counter would overflow.
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TaskRow {
    allocation: Vec<Units>,
    need: Vec<Units>,
}

impl TaskRow {
    fn new(nr_classes: usize) -> Self {
        Self {
            allocation: vec![0; nr_classes],
            need: vec![0; nr_classes],
        }
    }
}

/// The allocation state of all tasks over all resource classes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceState {
    available: Vec<Units>,
    class_live: Vec<bool>,
    rows: Vec<Option<TaskRow>>,
}

impl ResourceState {
    /// Creates an empty state with neither tasks nor resource classes.
    pub const fn new() -> Self {
        Self {
            available: Vec::new(),
            class_live: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Creates a state from explicit matrices.
    ///
    /// `allocation` and `need` are indexed by task, then by class.
    ///
    /// # Panics
    ///
    /// Panics if the dimensions of the matrices do not agree.
    pub fn from_matrices(
        available: Vec<Units>,
        allocation: Vec<Vec<Units>>,
        need: Vec<Vec<Units>>,
    ) -> Self {
        let nr_classes = available.len();
        assert_eq!(
            allocation.len(),
            need.len(),
            "allocation and need have different task counts"
        );

        let rows = allocation
            .into_iter()
            .zip(need)
            .map(|(allocation, need)| {
                assert_eq!(allocation.len(), nr_classes, "malformed allocation row");
                assert_eq!(need.len(), nr_classes, "malformed need row");
                Some(TaskRow { allocation, need })
            })
            .collect();

        Self {
            available,
            class_live: vec![true; nr_classes],
            rows,
        }
    }

    /// Returns the width of the matrices, including recycled class slots.
    pub fn nr_classes(&self) -> usize {
        self.available.len()
    }

    /// Returns the height of the matrices, including recycled task slots.
    pub fn nr_task_slots(&self) -> usize {
        self.rows.len()
    }

    pub fn is_task(&self, task: usize) -> bool {
        matches!(self.rows.get(task), Some(Some(_)))
    }

    pub fn is_class(&self, class: usize) -> bool {
        self.class_live.get(class).copied().unwrap_or(false)
    }

    pub fn available(&self) -> &[Units] {
        &self.available
    }

    pub fn allocation(&self, task: usize) -> Option<&[Units]> {
        self.row(task).ok().map(|row| row.allocation.as_slice())
    }

    pub fn need(&self, task: usize) -> Option<&[Units]> {
        self.row(task).ok().map(|row| row.need.as_slice())
    }

    /// Returns the total number of units of a class: the available ones plus
    /// the ones held by tasks.
    pub fn total(&self, class: usize) -> u64 {
        let held: u64 = self
            .rows
            .iter()
            .flatten()
            .map(|row| row.allocation[class] as u64)
            .sum();
        self.available[class] as u64 + held
    }

    /// Adds a resource class with `available` free units and returns its index.
    pub fn add_class(&mut self, available: Units) -> usize {
        if let Some(class) = self.class_live.iter().position(|live| !live) {
            self.class_live[class] = true;
            self.available[class] = available;
            return class;
        }

        self.available.push(available);
        self.class_live.push(true);
        for row in self.rows.iter_mut().flatten() {
            row.allocation.push(0);
            row.need.push(0);
        }
        self.available.len() - 1
    }

    /// Removes a resource class. The units held by tasks vanish with it.
    pub fn remove_class(&mut self, class: usize) -> Result<(), BankerError> {
        if !self.is_class(class) {
            return Err(BankerError::NoSuchClass);
        }

        self.class_live[class] = false;
        self.available[class] = 0;
        for row in self.rows.iter_mut().flatten() {
            row.allocation[class] = 0;
            row.need[class] = 0;
        }
        Ok(())
    }

    /// Overwrites the number of free units of a class.
    pub fn set_available(&mut self, class: usize, units: Units) -> Result<(), BankerError> {
        if !self.is_class(class) {
            return Err(BankerError::NoSuchClass);
        }
        self.available[class] = units;
        Ok(())
    }

    /// Adds newly created units to a class.
    pub fn supply(&mut self, class: usize, units: Units) -> Result<(), BankerError> {
        if !self.is_class(class) {
            return Err(BankerError::NoSuchClass);
        }
        self.available[class] = self.available[class]
            .checked_add(units)
            .ok_or(BankerError::Overflow)?;
        Ok(())
    }

    /// Adds a task that holds nothing and claims nothing.
    pub fn add_task(&mut self) -> usize {
        let row = TaskRow::new(self.nr_classes());
        if let Some(task) = self.rows.iter().position(Option::is_none) {
            self.rows[task] = Some(row);
            return task;
        }
        self.rows.push(Some(row));
        self.rows.len() - 1
    }

    /// Removes a task and returns the units it was holding.
    ///
    /// The returned units are not added back to the available vector; call
    /// [`Self::supply`] if they return to the pool.
    pub fn remove_task(&mut self, task: usize) -> Result<Vec<Units>, BankerError> {
        let row = self
            .rows
            .get_mut(task)
            .and_then(Option::take)
            .ok_or(BankerError::NoSuchTask)?;
        Ok(row.allocation)
    }

    /// Declares the maximum claim of a task, replacing any previous one.
    pub fn declare_claim(&mut self, task: usize, max_claim: &[Units]) -> Result<(), BankerError> {
        assert_eq!(max_claim.len(), self.nr_classes(), "malformed claim vector");

        let row = self.row_mut(task)?;
        if max_claim
            .iter()
            .zip(&row.allocation)
            .any(|(max, held)| max < held)
        {
            return Err(BankerError::ClaimBelowAllocation);
        }
        for (need, (max, held)) in row
            .need
            .iter_mut()
            .zip(max_claim.iter().zip(&row.allocation))
        {
            *need = max - held;
        }
        Ok(())
    }

    /// Raises the maximum claim of a task on one class.
    pub fn grow_need(&mut self, task: usize, class: usize, units: Units) -> Result<(), BankerError> {
        if !self.is_class(class) {
            return Err(BankerError::NoSuchClass);
        }
        let row = self.row_mut(task)?;
        row.need[class] = row.need[class]
            .checked_add(units)
            .ok_or(BankerError::Overflow)?;
        Ok(())
    }

    /// Lowers the maximum claim of a task on one class, saturating at the
    /// current allocation.
    pub fn shrink_need(&mut self, task: usize, class: usize, units: Units) -> Result<(), BankerError> {
        if !self.is_class(class) {
            return Err(BankerError::NoSuchClass);
        }
        let row = self.row_mut(task)?;
        row.need[class] = row.need[class].saturating_sub(units);
        Ok(())
    }

    /// Evaluates a request of `task` and commits it if the resulting state is safe.
    ///
    /// The scan for a completion order visits tasks in ascending index order,
    /// so the verdict only depends on the matrices.
    ///
    /// # Panics
    ///
    /// Panics if `request` does not have one entry per class slot.
    pub fn evaluate(&mut self, request: &[Units], task: usize) -> Verdict {
        assert_eq!(request.len(), self.nr_classes(), "malformed request vector");

        let Some(Some(row)) = self.rows.get(task) else {
            return Verdict::Error;
        };
        if request.iter().zip(&row.need).any(|(req, need)| req > need) {
            return Verdict::Error;
        }
        if request
            .iter()
            .zip(&row.allocation)
            .any(|(req, held)| held.checked_add(*req).is_none())
        {
            return Verdict::Error;
        }
        if request
            .iter()
            .zip(&self.available)
            .any(|(req, avail)| req > avail)
        {
            return Verdict::Wait;
        }

        self.apply(request, task);
        if self.is_safe() {
            return Verdict::Safe;
        }
        self.revert(request, task);
        Verdict::WaitUnsafe
    }

    /// Returns units held by `task` to the available pool.
    pub fn release(&mut self, task: usize, units: &[Units]) -> Result<(), BankerError> {
        assert_eq!(units.len(), self.nr_classes(), "malformed release vector");

        let row = self.row(task)?;
        if units.iter().zip(&row.allocation).any(|(u, held)| u > held) {
            return Err(BankerError::ExcessRelease);
        }
        if units
            .iter()
            .zip(&self.available)
            .any(|(u, avail)| avail.checked_add(*u).is_none())
        {
            return Err(BankerError::Overflow);
        }

        self.revert(units, task);
        Ok(())
    }

    /// Returns whether some order exists in which every task can finish.
    pub fn is_safe(&self) -> bool {
        self.safe_sequence().is_some()
    }

    /// Returns an order in which every task can obtain its remaining need and
    /// finish, or `None` if the state is unsafe.
    pub fn safe_sequence(&self) -> Option<Vec<usize>> {
        let mut work: Vec<u64> = self.available.iter().map(|&u| u as u64).collect();
        let mut finished: Vec<bool> = self.rows.iter().map(Option::is_none).collect();
        let mut sequence = Vec::new();

        loop {
            let mut progressed = false;
            for (task, row) in self.rows.iter().enumerate() {
                let Some(row) = row else {
                    continue;
                };
                if finished[task] {
                    continue;
                }
                if row
                    .need
                    .iter()
                    .zip(&work)
                    .all(|(&need, &avail)| need as u64 <= avail)
                {
                    for (avail, &held) in work.iter_mut().zip(&row.allocation) {
                        *avail += held as u64;
                    }
                    finished[task] = true;
                    sequence.push(task);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        finished.iter().all(|&done| done).then_some(sequence)
    }

    fn apply(&mut self, request: &[Units], task: usize) {
        let Some(Some(row)) = self.rows.get_mut(task) else {
            return;
        };
        for (class, &req) in request.iter().enumerate() {
            self.available[class] -= req;
            row.allocation[class] += req;
            row.need[class] -= req;
        }
    }

    fn revert(&mut self, request: &[Units], task: usize) {
        let Some(Some(row)) = self.rows.get_mut(task) else {
            return;
        };
        for (class, &req) in request.iter().enumerate() {
            self.available[class] += req;
            row.allocation[class] -= req;
            row.need[class] += req;
        }
    }

    fn row(&self, task: usize) -> Result<&TaskRow, BankerError> {
        self.rows
            .get(task)
            .and_then(Option::as_ref)
            .ok_or(BankerError::NoSuchTask)
    }

    fn row_mut(&mut self, task: usize) -> Result<&mut TaskRow, BankerError> {
        self.rows
            .get_mut(task)
            .and_then(Option::as_mut)
            .ok_or(BankerError::NoSuchTask)
    }
}

#[cfg(test)]
mod test {
    use rand::{Rng, SeedableRng, rngs::SmallRng};

    use super::*;

    /// The five-task, three-class example found in most OS textbooks.
    fn textbook() -> ResourceState {
        ResourceState::from_matrices(
            vec![3, 3, 2],
            vec![
                vec![0, 1, 0],
                vec![2, 0, 0],
                vec![3, 0, 2],
                vec![2, 1, 1],
                vec![0, 0, 2],
            ],
            vec![
                vec![7, 4, 3],
                vec![1, 2, 2],
                vec![6, 0, 0],
                vec![0, 1, 1],
                vec![4, 3, 1],
            ],
        )
    }

    #[test]
    fn textbook_initial_state_is_safe() {
        let state = textbook();
        assert_eq!(state.safe_sequence(), Some(vec![1, 3, 4, 0, 2]));
    }

    #[test]
    fn textbook_safe_request() {
        let mut state = textbook();
        assert_eq!(state.evaluate(&[1, 0, 2], 1), Verdict::Safe);
        assert_eq!(state.available(), &[2, 3, 0]);
        assert_eq!(state.allocation(1), Some([3, 0, 2].as_slice()));
        assert_eq!(state.need(1), Some([0, 2, 0].as_slice()));
    }

    #[test]
    fn textbook_unavailable_request() {
        let mut state = textbook();
        assert_eq!(state.evaluate(&[1, 0, 2], 1), Verdict::Safe);

        let before = state.clone();
        assert_eq!(state.evaluate(&[3, 3, 0], 4), Verdict::Wait);
        assert_eq!(state, before);
    }

    #[test]
    fn textbook_unsafe_request_rolls_back() {
        let mut state = textbook();
        assert_eq!(state.evaluate(&[1, 0, 2], 1), Verdict::Safe);

        let before = state.clone();
        assert_eq!(state.evaluate(&[0, 2, 0], 0), Verdict::WaitUnsafe);
        assert_eq!(state, before);
    }

    #[test]
    fn request_beyond_need() {
        let mut state = textbook();
        assert_eq!(state.evaluate(&[1, 0, 2], 1), Verdict::Safe);

        let before = state.clone();
        assert_eq!(state.evaluate(&[1, 0, 0], 1), Verdict::Error);
        assert_eq!(state, before);
    }

    #[test]
    fn release_restores_availability() {
        let mut state = textbook();
        assert_eq!(state.evaluate(&[1, 0, 2], 1), Verdict::Safe);
        state.release(1, &[1, 0, 2]).unwrap();
        assert_eq!(state, textbook());

        assert_eq!(
            state.release(1, &[9, 0, 0]),
            Err(BankerError::ExcessRelease)
        );
    }

    #[test]
    fn classes_and_tasks_are_recycled() {
        let mut state = ResourceState::new();
        let a = state.add_class(2);
        let b = state.add_class(1);
        let t0 = state.add_task();
        let t1 = state.add_task();
        assert_eq!((a, b, t0, t1), (0, 1, 0, 1));

        state.declare_claim(t0, &[2, 1]).unwrap();
        assert_eq!(state.evaluate(&[1, 1], t0), Verdict::Safe);
        assert_eq!(state.total(a), 2);

        state.remove_class(a).unwrap();
        assert_eq!(state.allocation(t0), Some([0, 1].as_slice()));
        assert_eq!(state.add_class(5), a);
        assert_eq!(state.available(), &[5, 0]);

        assert_eq!(state.remove_task(t0), Ok(vec![0, 1]));
        assert!(!state.is_task(t0));
        assert_eq!(state.add_task(), t0);
        assert_eq!(state.need(t0), Some([0, 0].as_slice()));
    }

    #[test]
    fn claim_below_allocation() {
        let mut state = ResourceState::new();
        state.add_class(3);
        let task = state.add_task();
        state.declare_claim(task, &[3]).unwrap();
        assert_eq!(state.evaluate(&[2], task), Verdict::Safe);
        assert_eq!(
            state.declare_claim(task, &[1]),
            Err(BankerError::ClaimBelowAllocation)
        );
        state.declare_claim(task, &[2]).unwrap();
        assert_eq!(state.need(task), Some([0].as_slice()));
    }

    #[test]
    fn unknown_task_is_an_error() {
        let mut state = ResourceState::new();
        state.add_class(1);
        assert_eq!(state.evaluate(&[1], 3), Verdict::Error);
    }

    #[test]
    #[should_panic]
    fn dimension_mismatch_is_fatal() {
        let mut state = textbook();
        state.evaluate(&[1, 0], 1);
    }

    /// Decides safety by trying every completion order.
    fn exhaustive_is_safe(available: &[u64], rows: &[(Vec<Units>, Vec<Units>)]) -> bool {
        fn search(work: &[u64], rows: &[(Vec<Units>, Vec<Units>)], finished: &mut [bool]) -> bool {
            if finished.iter().all(|&done| done) {
                return true;
            }
            for task in 0..rows.len() {
                if finished[task] {
                    continue;
                }
                let (allocation, need) = &rows[task];
                if need.iter().zip(work).all(|(&n, &w)| n as u64 <= w) {
                    let next: Vec<u64> = work
                        .iter()
                        .zip(allocation)
                        .map(|(&w, &a)| w + a as u64)
                        .collect();
                    finished[task] = true;
                    if search(&next, rows, finished) {
                        return true;
                    }
                    finished[task] = false;
                }
            }
            false
        }

        let mut finished = vec![false; rows.len()];
        search(available, rows, &mut finished)
    }

    fn oracle(
        available: &[Units],
        rows: &[(Vec<Units>, Vec<Units>)],
        request: &[Units],
        task: usize,
    ) -> Verdict {
        let (allocation, need) = &rows[task];
        if request.iter().zip(need).any(|(r, n)| r > n) {
            return Verdict::Error;
        }
        if request.iter().zip(available).any(|(r, a)| r > a) {
            return Verdict::Wait;
        }

        let work: Vec<u64> = available
            .iter()
            .zip(request)
            .map(|(&a, &r)| (a - r) as u64)
            .collect();
        let mut tentative = rows.to_vec();
        tentative[task] = (
            allocation.iter().zip(request).map(|(a, r)| a + r).collect(),
            need.iter().zip(request).map(|(n, r)| n - r).collect(),
        );

        if exhaustive_is_safe(&work, &tentative) {
            Verdict::Safe
        } else {
            Verdict::WaitUnsafe
        }
    }

    #[test]
    fn matches_exhaustive_oracle() {
        let mut rng = SmallRng::seed_from_u64(0x5eed_ba4c);

        for _ in 0..2000 {
            let nr_classes = rng.random_range(1..=3);
            let nr_tasks = rng.random_range(1..=5);

            let available: Vec<Units> = (0..nr_classes).map(|_| rng.random_range(0..4)).collect();
            let rows: Vec<(Vec<Units>, Vec<Units>)> = (0..nr_tasks)
                .map(|_| {
                    let allocation = (0..nr_classes).map(|_| rng.random_range(0..3)).collect();
                    let need = (0..nr_classes).map(|_| rng.random_range(0..4)).collect();
                    (allocation, need)
                })
                .collect();
            let task = rng.random_range(0..nr_tasks);
            let request: Vec<Units> = (0..nr_classes).map(|_| rng.random_range(0..3)).collect();

            let mut state = ResourceState::from_matrices(
                available.clone(),
                rows.iter().map(|(a, _)| a.clone()).collect(),
                rows.iter().map(|(_, n)| n.clone()).collect(),
            );
            let before = state.clone();

            let expected = oracle(&available, &rows, &request, task);
            assert_eq!(state.evaluate(&request, task), expected);

            if expected == Verdict::Safe {
                state.release(task, &request).unwrap();
            }
            assert_eq!(state, before);
        }
    }
}
