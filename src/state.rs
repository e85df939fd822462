// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Lifecycle of a transport component.
//!
//! `Uninitialized -> TopologyDeclared -> Consuming -> Faulted`. Publishers that
//! never consume go straight from `TopologyDeclared` to `Ready`. `Faulted` is
//! terminal: recovery means building a new component on a new channel.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Uninitialized = 0,
    TopologyDeclared = 1,
    Consuming = 2,
    Ready = 3,
    Faulted = 4,
}

impl From<u8> for State {
    fn from(value: u8) -> Self {
        match value {
            1 => State::TopologyDeclared,
            2 => State::Consuming,
            3 => State::Ready,
            4 => State::Faulted,
            _ => State::Uninitialized,
        }
    }
}

/// Shared, lock free holder of a component's [`State`].
#[derive(Debug, Clone, Default)]
pub struct Lifecycle(Arc<AtomicU8>);

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle::default()
    }

    pub fn get(&self) -> State {
        State::from(self.0.load(Ordering::Acquire))
    }

    /// Moves to `next` unless the component is already faulted.
    pub fn advance(&self, next: State) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != State::Faulted as u8).then_some(next as u8)
            })
            .is_ok()
    }

    pub fn fault(&self) {
        self.0.store(State::Faulted as u8, Ordering::Release);
    }

    pub fn is_faulted(&self) -> bool {
        self.get() == State::Faulted
    }
}
