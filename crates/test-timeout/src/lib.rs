//! `#[tokio_timeout_test]`: an async test on a fresh current-thread runtime,
//! watched from a plain thread so a wedged runtime still fails the test.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]
//! async fn default_budget() {}
//!
//! #[test_timeout::tokio_timeout_test(secs = 5)]
//! async fn short_budget() {}
//! ```

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_SECS: u64 = 30;

struct TimeoutArgs {
    secs: u64,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Self { secs: DEFAULT_SECS });
        }
        let lit = if input.peek(Ident) {
            let key: Ident = input.parse()?;
            if key != "secs" {
                return Err(syn::Error::new(key.span(), "expected `secs = <n>`"));
            }
            input.parse::<Token![=]>()?;
            input.parse::<LitInt>()?
        } else {
            input.parse::<LitInt>()?
        };
        let secs: u64 = lit.base10_parse()?;
        if secs == 0 {
            return Err(syn::Error::new(lit.span(), "timeout must be greater than zero"));
        }
        if !input.is_empty() {
            return Err(input.error("unexpected tokens after timeout"));
        }
        Ok(Self { secs })
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TimeoutArgs { secs } = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(&sig.fn_token, "expected an `async fn` test")
            .to_compile_error()
            .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs.into_iter().filter(|a| !is_test_marker(a)).collect();
    let name = sig.ident.to_string();
    let thread_name = syn::LitStr::new(&format!("test-{name}"), Span::call_site());

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let budget = ::std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = ::std::sync::mpsc::channel();
            let worker = ::std::thread::Builder::new()
                .name(#thread_name.into())
                .spawn(move || {
                    let outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                        let runtime = ::tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .expect("build test runtime");
                        runtime.block_on(async move {
                            if ::tokio::time::timeout(budget, async move #block).await.is_err() {
                                panic!("{} exceeded {:?}", #name, budget);
                            }
                        });
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("spawn test thread");
            match done_rx.recv_timeout(budget + ::std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {
                    let _ = worker.join();
                }
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} wedged its runtime past {:?}", #name, budget)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} test thread exited without reporting", #name)
                }
            }
        }
    })
}

/// Drops `#[test]` / `#[tokio::test]` so the function is not registered twice.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|s| s.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
