// SPDX-License-Identifier: MPL-2.0

mod wait;

pub use self::wait::{Waiter, Waker};
