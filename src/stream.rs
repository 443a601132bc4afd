//! Callback-to-pull bridge.
//!
//! Platform callbacks push into a [`LiveChannel`] (non-blocking, safe from
//! any thread or ISR); exactly one consumer pulls from it through a
//! [`LiveStream`] handle. Opening the channel again closes the previous
//! sequence: the old handle yields `None` from then on and anything still
//! buffered for it is discarded.
//!
//! The producer side can observe the consumer going away: when the last
//! handle of the current sequence is dropped, [`LiveChannel::disconnected`]
//! resolves.

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_sync::waitqueue::WakerRegistration;

/// Why a pushed item did not reach a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dropped {
    /// Nobody has the current sequence open.
    NoConsumer,
    /// The consumer is not keeping up and the buffer is full.
    Full,
}

struct Registry {
    generation: u32,
    consumers: u32,
    /// Parked consumer, woken when its sequence is replaced or closed.
    consumer: WakerRegistration,
}

/// Single-consumer live sequence fed by callbacks.
///
/// Every receive and push happens under the registry lock, so the
/// generation a consumer checks is the generation it receives under: a
/// replaced consumer can never take an item meant for its successor.
pub struct LiveChannel<T, const N: usize> {
    channel: Channel<CriticalSectionRawMutex, T, N>,
    registry: Mutex<CriticalSectionRawMutex, RefCell<Registry>>,
    /// Raised when the last handle of the current sequence is dropped.
    gone: Signal<CriticalSectionRawMutex, ()>,
}

impl<T, const N: usize> LiveChannel<T, N> {
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
            registry: Mutex::new(RefCell::new(Registry {
                generation: 0,
                consumers: 0,
                consumer: WakerRegistration::new(),
            })),
            gone: Signal::new(),
        }
    }

    /// Start a new sequence, closing any previous one.
    pub fn open(&self) -> LiveStream<'_, T, N> {
        let generation = self.registry.lock(|r| {
            let mut reg = r.borrow_mut();
            reg.generation = reg.generation.wrapping_add(1);
            reg.consumers = 1;
            self.channel.clear();
            reg.consumer.wake();
            reg.generation
        });
        self.gone.reset();
        LiveStream {
            live: self,
            generation,
        }
    }

    /// Another handle on the current sequence, or a fresh sequence when
    /// nobody holds the current one.
    pub fn attach(&self) -> LiveStream<'_, T, N> {
        let attached = self.registry.lock(|r| {
            let mut reg = r.borrow_mut();
            if reg.consumers == 0 {
                return None;
            }
            reg.consumers += 1;
            Some(reg.generation)
        });
        match attached {
            Some(generation) => LiveStream {
                live: self,
                generation,
            },
            None => self.open(),
        }
    }

    /// End the current sequence. Handles yield `None`; later pushes are
    /// dropped until the next [`open`](Self::open).
    pub fn close(&self) {
        self.registry.lock(|r| {
            let mut reg = r.borrow_mut();
            reg.generation = reg.generation.wrapping_add(1);
            reg.consumers = 0;
            self.channel.clear();
            reg.consumer.wake();
        });
    }

    /// Non-blocking push from the producer side.
    pub fn try_push(&self, item: T) -> Result<(), Dropped> {
        self.try_push_keeping(item, 0)
    }

    /// Push only while more than `keep_free` slots stay free, leaving that
    /// headroom to higher-priority items pushed with [`try_push`](Self::try_push).
    pub fn try_push_keeping(&self, item: T, keep_free: usize) -> Result<(), Dropped> {
        self.registry.lock(|r| {
            if r.borrow().consumers == 0 {
                return Err(Dropped::NoConsumer);
            }
            if self.channel.free_capacity() <= keep_free {
                return Err(Dropped::Full);
            }
            self.channel.try_send(item).map_err(|_| Dropped::Full)
        })
    }

    pub fn has_consumer(&self) -> bool {
        self.registry.lock(|r| r.borrow().consumers > 0)
    }

    /// Resolves once no handle on the current sequence remains.
    pub async fn disconnected(&self) {
        loop {
            if !self.has_consumer() {
                return;
            }
            self.gone.wait().await;
        }
    }

    fn release(&self, generation: u32) {
        let last = self.registry.lock(|r| {
            let mut reg = r.borrow_mut();
            if reg.generation != generation || reg.consumers == 0 {
                return false;
            }
            reg.consumers -= 1;
            reg.consumers == 0
        });
        if last {
            self.gone.signal(());
        }
    }
}

impl<T, const N: usize> Default for LiveChannel<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer handle on one sequence of a [`LiveChannel`].
pub struct LiveStream<'a, T, const N: usize> {
    live: &'a LiveChannel<T, N>,
    generation: u32,
}

impl<'a, T, const N: usize> LiveStream<'a, T, N> {
    /// Next item, or `None` once this sequence was closed or replaced.
    pub async fn next(&mut self) -> Option<T> {
        poll_fn(|cx| {
            self.live.registry.lock(|r| {
                let mut reg = r.borrow_mut();
                if reg.generation != self.generation {
                    return Poll::Ready(None);
                }
                reg.consumer.register(cx.waker());
                self.live.channel.poll_receive(cx).map(Some)
            })
        })
        .await
    }

    /// Item already buffered, without waiting.
    pub fn try_next(&mut self) -> Option<T> {
        self.live.registry.lock(|r| {
            if r.borrow().generation != self.generation {
                return None;
            }
            self.live.channel.try_receive().ok()
        })
    }

    pub fn is_open(&self) -> bool {
        self.live
            .registry
            .lock(|r| r.borrow().generation == self.generation)
    }

    /// Whether both handles read the same sequence.
    pub fn same_sequence(&self, other: &LiveStream<'_, T, N>) -> bool {
        core::ptr::eq(self.live, other.live) && self.generation == other.generation
    }
}

impl<T, const N: usize> Drop for LiveStream<'_, T, N> {
    fn drop(&mut self) {
        self.live.release(self.generation);
    }
}
