use std::{collections::HashMap, task::Waker};

/// Identifies one future's waker inside a [`WakerSet`]. Not clonable, so a
/// token stays tied to the single future that registered it.
#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(u64);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// The wakers of every future waiting on one batch window.
///
/// Only one task needs to drive a window: it polls the window's delay and
/// then the handler future. That task's waker is the "driving waker", and
/// it is always the waker that most recently polled. Every other future
/// just waits for the result.
///
/// When the driving future is dropped, another waker is promoted to driver
/// and woken immediately, so that the shared work always has a task
/// pushing it forward. When the result is ready, every remaining waker is
/// woken to collect its value.
#[derive(Debug, Default)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,
    driver: Option<Token>,

    // Windows are short lived; a u64 counter won't wrap.
    next_token: u64,
}

impl WakerSet {
    /// Record the waker of a future that is about to return `Pending`,
    /// making it the driving waker. The first call for a future creates its
    /// token; later calls replace the stored waker in place.
    pub(crate) fn register(&mut self, token: &mut Option<Token>, waker: &Waker) {
        match token {
            Some(token) => match self.wakers.get_mut(token) {
                Some(existing) => {
                    if !existing.will_wake(waker) {
                        existing.clone_from(waker);
                    }
                    self.driver = Some(token.duplicate());
                }
                None => panic!("Attempted to update a waker with a token from another WakerSet"),
            },
            None => {
                let new_token = Token(self.next_token);
                self.next_token += 1;

                self.wakers.insert(new_token.duplicate(), waker.clone());
                self.driver = Some(new_token.duplicate());
                *token = Some(new_token);
            }
        }
    }

    /// Wake the driving waker, if there is one. Used when the window's delay
    /// was cancelled and the window needs to be dispatched right away.
    pub(crate) fn wake_driver(&self) {
        if let Some(waker) = self.driver.as_ref().and_then(|token| self.wakers.get(token)) {
            waker.wake_by_ref();
        }
    }

    /// Remove the waker of a future that is being dropped. If it was the
    /// driver (or there's no driver at all), some other waker is promoted
    /// and woken so that it will poll and take over.
    pub(crate) fn discard_and_wake(&mut self, token: Token) {
        self.wakers.remove(&token);

        let lost_driver = match self.driver {
            None => true,
            Some(ref driver) => *driver == token,
        };

        if lost_driver {
            self.driver = match self.wakers.iter().next() {
                None => None,
                Some((next, waker)) => {
                    waker.wake_by_ref();
                    Some(next.duplicate())
                }
            };
        }
    }

    /// Wake every waker except `skip`, which belongs to the future that is
    /// about to take its own result.
    pub(crate) fn wake_all_except(mut self, skip: Option<Token>) {
        if let Some(token) = skip {
            self.wakers.remove(&token);
        }

        self.wakers.into_iter().for_each(|(_token, waker)| waker.wake());
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.wakers.len()
    }
}
