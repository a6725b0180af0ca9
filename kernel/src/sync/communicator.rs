//! Speaker/listener rendezvous.
//!
//! A communicator pairs exactly one speaker with exactly one listener per
//! exchanged word; neither side returns until it has been paired. Pairing
//! order among queued speakers and listeners follows the scheduler's wake
//! policy on the underlying non-transferring queues.

use std::sync::{Arc, Mutex};

use crate::{Kernel, sync::{Condition, Lock}};

struct State {
    /// The word currently in flight, if a speaker has placed one.
    word: Option<i32>,
    /// Listeners that have announced themselves and wait to be paired.
    listeners: u32,
}

pub struct Communicator {
    lock: Arc<Lock>,
    non_speaker: Condition,
    non_listener: Condition,
    state: Mutex<State>,
}

impl Communicator {
    pub fn new(kernel: &Arc<Kernel>) -> Communicator {
        let lock = Arc::new(Lock::new(kernel));
        Communicator {
            non_speaker: Condition::new(kernel, lock.clone()),
            non_listener: Condition::new(kernel, lock.clone()),
            lock,
            state: Mutex::new(State {
                word: None,
                listeners: 0,
            }),
        }
    }

    /// Transfers `word` to exactly one listener, waiting for one to turn
    /// up.
    pub fn speak(&self, word: i32) {
        self.lock.acquire();
        loop {
            let state = self.state.lock().unwrap();
            if state.listeners > 0 && state.word.is_none() {
                break;
            }
            drop(state);
            self.non_listener.sleep();
        }
        let mut state = self.state.lock().unwrap();
        state.word = Some(word);
        state.listeners -= 1;
        drop(state);
        self.non_speaker.wake();
        self.lock.release();
    }

    /// Waits for a speaker and returns its word.
    pub fn listen(&self) -> i32 {
        self.lock.acquire();
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.word.is_some() {
                    break;
                }
                state.listeners += 1;
            }
            self.non_listener.wake();
            self.non_speaker.sleep();
        }
        let word = self.state.lock().unwrap().word.take().unwrap();
        self.non_listener.wake();
        self.lock.release();
        word
    }
}
