#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]

//! Test macro for iomgr engines.

mod entry;
mod parse;

/// Runs a test against a freshly built engine.
///
/// The test function takes the engine by reference, or no argument at all.
/// The engine is shut down once the body returns.
///
/// # Engines
///
/// `engine` selects the poll strategy: `"epoll"` (the default), `"poll"`,
/// or `"env"` to read `IOMGR_POLL_STRATEGY`.
///
/// ```ignore
/// #[iomgr::test(engine = "poll")]
/// fn my_test(engine: &iomgr::Engine) {
///     let pollset = engine.pollset();
///     pollset.destroy();
/// }
/// ```
///
/// # Pollers per island
///
/// `max_pollers` sets how many workers may poll the same island at once.
/// It requires the epoll engine.
///
/// ```ignore
/// #[iomgr::test(engine = "epoll", max_pollers = 4)]
/// fn my_test(engine: &iomgr::Engine) -> anyhow::Result<()> {
///     Ok(())
/// }
/// ```
///
/// Equivalent code not using `#[iomgr::test]`
///
/// ```ignore
/// #[test]
/// fn my_test() -> anyhow::Result<()> {
///     fn body(engine: &iomgr::Engine) -> anyhow::Result<()> {
///         Ok(())
///     }
///
///     let engine = iomgr::runtime::Builder::new_epoll()
///         .max_pollers_per_island(4)
///         .try_build()
///         .unwrap();
///     let result = body(&engine);
///     engine.shutdown();
///     result
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
