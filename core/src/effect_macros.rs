//! Effect construction macro

/// Create an `Effect::Future` from an async block body
///
/// # Example
///
/// ```rust,ignore
/// use ticketchain_core::async_effect;
///
/// async_effect! {
///     let gas = ledger.estimate_gas(&request).await.ok()?;
///     Some(IntentAction::Estimated { id, gas })
/// }
/// ```
#[macro_export]
macro_rules! async_effect {
    ($($body:tt)*) => {
        $crate::effect::Effect::Future(
            ::std::boxed::Box::pin(async move { $($body)* })
        )
    };
}
