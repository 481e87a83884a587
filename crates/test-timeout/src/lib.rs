//! `#[tokio_timeout_test]`: an async test on a multi-threaded Tokio runtime
//! that fails instead of hanging when it overruns its wall-clock limit.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(secs = 30, workers = 4)]
//! async fn spawns_and_kills_children() { /* ... */ }
//! ```
//!
//! The body runs on its own thread, so the limit holds even when the test
//! blocks a runtime worker.

use proc_macro::TokenStream;
use quote::quote;
use syn::{meta::ParseNestedMeta, parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_SECS: u64 = 60;
const DEFAULT_WORKERS: usize = 2;

struct Options {
    secs: u64,
    workers: usize,
}

impl Options {
    fn parse(&mut self, meta: ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("secs") {
            self.secs = positive(meta.value()?.parse()?)?;
            Ok(())
        } else if meta.path.is_ident("workers") {
            self.workers = positive(meta.value()?.parse()?)?;
            Ok(())
        } else {
            Err(meta.error("expected `secs = <n>` or `workers = <n>`"))
        }
    }
}

fn positive<N>(lit: LitInt) -> syn::Result<N>
where
    N: std::str::FromStr + PartialEq + From<u8>,
    N::Err: std::fmt::Display,
{
    let value: N = lit.base10_parse()?;
    if value == N::from(0) {
        return Err(syn::Error::new(lit.span(), "must be greater than zero"));
    }
    Ok(value)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut options = Options {
        secs: DEFAULT_SECS,
        workers: DEFAULT_WORKERS,
    };
    let parser = syn::meta::parser(|meta| options.parse(meta));
    parse_macro_input!(attr with parser);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.ident, "expected an async test function")
            .to_compile_error()
            .into();
    }
    let attrs: Vec<Attribute> = attrs.into_iter().filter(|a| !is_test_attr(a)).collect();
    let Options { secs, workers } = options;
    let name = sig.ident.to_string();

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(#name.into())
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = tokio::runtime::Builder::new_multi_thread()
                            .worker_threads(#workers)
                            .enable_all()
                            .build()
                            .expect("failed to build Tokio runtime");
                        runtime.block_on(async move #block);
                        runtime.shutdown_timeout(std::time::Duration::from_secs(1));
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("failed to spawn test thread");
            match done_rx.recv_timeout(limit) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} exceeded its {}s limit", #name, #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} exited without reporting a result", #name)
                }
            }
        }
    })
}

// `#[test]` and `#[tokio::test]` would duplicate or fight the generated harness.
fn is_test_attr(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
