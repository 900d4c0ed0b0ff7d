//! Ergonomic testing utilities for reducers
//!
//! This module provides a fluent API for testing reducers with readable Given-When-Then syntax.

#![allow(clippy::module_name_repetitions)] // ReducerTest is the natural name

use ticketchain_core::{effect::Effect, reducer::Reducer};

/// Type alias for state assertion functions
type StateAssertion<S> = Box<dyn FnOnce(&S)>;

/// Type alias for effect assertion functions
type EffectAssertion<A> = Box<dyn FnOnce(&[Effect<A>])>;

/// Type alias for environment assertion functions
type EnvAssertion<E> = Box<dyn FnOnce(&E)>;

/// Fluent API for testing reducers with Given-When-Then syntax
///
/// # Example
///
/// ```ignore
/// use ticketchain_testing::ReducerTest;
///
/// ReducerTest::new(IntentReducer)
///     .with_env(test_environment())
///     .given_state(IntentState::default())
///     .when_action(IntentAction::Initiate { intent_id, request })
///     .then_state(|state| {
///         assert_eq!(state.phase(&intent_id), Some(IntentPhase::Estimating));
///     })
///     .then_effects(|effects| {
///         assertions::assert_has_future_effect(effects);
///     })
///     .run();
/// ```
pub struct ReducerTest<R, S, A, E>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    reducer: R,
    environment: Option<E>,
    initial_state: Option<S>,
    action: Option<A>,
    state_assertions: Vec<StateAssertion<S>>,
    effect_assertions: Vec<EffectAssertion<A>>,
    env_assertions: Vec<EnvAssertion<E>>,
}

impl<R, S, A, E> ReducerTest<R, S, A, E>
where
    R: Reducer<State = S, Action = A, Environment = E>,
    S: Clone,
    A: Clone,
{
    /// Create a new reducer test with the given reducer
    #[must_use]
    pub const fn new(reducer: R) -> Self {
        Self {
            reducer,
            environment: None,
            initial_state: None,
            action: None,
            state_assertions: Vec::new(),
            effect_assertions: Vec::new(),
            env_assertions: Vec::new(),
        }
    }

    /// Set the environment for the test
    #[must_use]
    pub fn with_env(mut self, env: E) -> Self {
        self.environment = Some(env);
        self
    }

    /// Set the initial state (Given)
    #[must_use]
    pub fn given_state(mut self, state: S) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Set the action to test (When)
    #[must_use]
    pub fn when_action(mut self, action: A) -> Self {
        self.action = Some(action);
        self
    }

    /// Add an assertion about the resulting state (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&S) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the resulting effects (Then)
    #[must_use]
    pub fn then_effects<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[Effect<A>]) + 'static,
    {
        self.effect_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the environment after the reducer ran (Then)
    ///
    /// Reducers never perform I/O, so this is mostly used to check that a mock
    /// ledger saw no traffic.
    #[must_use]
    pub fn then_env<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&E) + 'static,
    {
        self.env_assertions.push(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if initial state, action, or environment is not set,
    /// or if any assertions fail.
    #[allow(clippy::panic)] // Test code can panic
    #[allow(clippy::expect_used)] // Test code can use expect
    pub fn run(self) {
        let mut state = self
            .initial_state
            .expect("Initial state must be set with given_state()");

        let action = self.action.expect("Action must be set with when_action()");

        let env = self
            .environment
            .expect("Environment must be set with with_env()");

        // Execute reducer
        let effects = self.reducer.reduce(&mut state, action, &env);

        // Run state assertions
        for assertion in self.state_assertions {
            assertion(&state);
        }

        // Run effect assertions
        for assertion in self.effect_assertions {
            assertion(&effects);
        }

        for assertion in self.env_assertions {
            assertion(&env);
        }
    }
}

/// Helper assertions for effects
pub mod assertions {
    use ticketchain_core::effect::Effect;

    /// Assert that there are no effects
    ///
    /// # Panics
    ///
    /// Panics if effects is not empty.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_no_effects<A: std::fmt::Debug>(effects: &[Effect<A>]) {
        assert!(
            effects.is_empty() || matches!(effects, [Effect::None]),
            "Expected no effects, but found {}: {:?}",
            effects.len(),
            effects
        );
    }

    /// Assert the number of effects
    ///
    /// # Panics
    ///
    /// Panics if the number of effects doesn't match expected.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_effects_count<A>(effects: &[Effect<A>], expected: usize) {
        assert_eq!(
            effects.len(),
            expected,
            "Expected {} effects, but found {}",
            expected,
            effects.len()
        );
    }

    /// Assert that effects contain at least one Future effect
    ///
    /// # Panics
    ///
    /// Panics if no Future effect is found.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_has_future_effect<A>(effects: &[Effect<A>]) {
        assert!(
            effects.iter().any(|e| matches!(e, Effect::Future(_))),
            "Expected at least one Future effect, but none found"
        );
    }

    /// Assert that effects contain at least one Delay effect
    ///
    /// # Panics
    ///
    /// Panics if no Delay effect is found.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_has_delay_effect<A>(effects: &[Effect<A>]) {
        assert!(
            effects.iter().any(|e| matches!(e, Effect::Delay { .. })),
            "Expected at least one Delay effect, but none found"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;
    use ticketchain_core::{SmallVec, smallvec};

    #[derive(Clone, Debug)]
    struct SeatState {
        sold: u32,
        capacity: u32,
    }

    #[derive(Clone, Debug)]
    enum SeatAction {
        Reserve,
        Release,
        Expire,
    }

    struct SeatReducer;

    #[derive(Default)]
    struct SeatEnv {
        lookups: Cell<u32>,
    }

    impl Reducer for SeatReducer {
        type State = SeatState;
        type Action = SeatAction;
        type Environment = SeatEnv;

        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]> {
            env.lookups.set(env.lookups.get() + 1);
            match action {
                SeatAction::Reserve if state.sold < state.capacity => {
                    state.sold += 1;
                    smallvec![Effect::Delay {
                        duration: Duration::from_secs(60),
                        action: Box::new(SeatAction::Expire),
                    }]
                },
                SeatAction::Reserve => smallvec![Effect::None],
                SeatAction::Release | SeatAction::Expire => {
                    state.sold = state.sold.saturating_sub(1);
                    smallvec![Effect::None]
                },
            }
        }
    }

    #[test]
    fn reserve_schedules_expiry() {
        ReducerTest::new(SeatReducer)
            .with_env(SeatEnv::default())
            .given_state(SeatState { sold: 0, capacity: 2 })
            .when_action(SeatAction::Reserve)
            .then_state(|state| assert_eq!(state.sold, 1))
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 1);
                assertions::assert_has_delay_effect(effects);
            })
            .then_env(|env| assert_eq!(env.lookups.get(), 1))
            .run();
    }

    #[test]
    fn reserve_at_capacity_does_nothing() {
        ReducerTest::new(SeatReducer)
            .with_env(SeatEnv::default())
            .given_state(SeatState { sold: 2, capacity: 2 })
            .when_action(SeatAction::Reserve)
            .then_state(|state| assert_eq!(state.sold, 2))
            .then_effects(|effects| assertions::assert_no_effects(effects))
            .run();
    }

    #[test]
    fn release_never_underflows() {
        ReducerTest::new(SeatReducer)
            .with_env(SeatEnv::default())
            .given_state(SeatState { sold: 0, capacity: 2 })
            .when_action(SeatAction::Release)
            .then_state(|state| assert_eq!(state.sold, 0))
            .run();
    }
}
