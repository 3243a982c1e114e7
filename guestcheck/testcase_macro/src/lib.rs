// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, spanned::Spanned, FnArg, ItemFn, Pat};

/// The macro for labeling guestcheck testcases.
///
/// Testcase functions have the signature `async fn test(ctx: &TestCtx)`.
/// The macro turns the function into one that returns a boxed future
/// resolving to a `guestcheck_testcase::TestOutcome` and creates an entry in
/// the test case inventory that allows the runner to enumerate the test.
///
/// The body may use the `?` operator and `return Ok(())` to pass early. The
/// error it returns decides the outcome: assertion failures fail the test,
/// skips skip it, and everything else is a test error.
#[proc_macro_attribute]
pub fn guestcheck_testcase(
    _attrib: TokenStream,
    input: TokenStream,
) -> TokenStream {
    let item_fn = parse_macro_input!(input as ItemFn);

    let ctx_ident = match item_fn.sig.inputs.first() {
        Some(FnArg::Typed(arg)) => match &*arg.pat {
            Pat::Ident(pat) => pat.ident.clone(),
            other => {
                return syn::Error::new(
                    other.span(),
                    "the test context must be bound to a plain identifier",
                )
                .to_compile_error()
                .into()
            }
        },
        _ => {
            return syn::Error::new(
                item_fn.sig.span(),
                "testcases take exactly one argument, `ctx: &TestCtx`",
            )
            .to_compile_error()
            .into()
        }
    };

    // Build the inventory record for this test. The `module_path!()` in the
    // generated code allows the test case to report the fully-qualified path to
    // itself regardless of where it's located.
    let fn_ident = item_fn.sig.ident.clone();
    let fn_name = fn_ident.to_string();
    let submit: proc_macro2::TokenStream = quote! {
        guestcheck_testcase::inventory_submit! {
            guestcheck_testcase::TestCase::new(
                module_path!(),
                #fn_name,
                guestcheck_testcase::TestFunction { f: #fn_ident }
            )
        }
    };

    // Rebuild the test body into an async block that returns an
    // `anyhow::Result`, then map its result to an outcome.
    let fn_vis = item_fn.vis.clone();
    let fn_inputs = item_fn.sig.inputs.clone();
    let fn_block = item_fn.block;
    let remade_fn = quote! {
        #[allow(unreachable_code)]
        #fn_vis fn #fn_ident(#fn_inputs) -> guestcheck_testcase::BoxFuture<
            '_,
            guestcheck_testcase::TestOutcome,
        > {
            Box::pin(async move {
                let result = async {
                    #fn_block
                    Ok::<(), guestcheck_testcase::anyhow::Error>(())
                }
                .await;
                match result {
                    Ok(()) => guestcheck_testcase::TestOutcome::Passed,
                    Err(e) => guestcheck_testcase::TestOutcome::from_error(
                        &e,
                        &#ctx_ident.reporter,
                    ),
                }
            })
        }
    };

    quote! {
        #remade_fn

        #submit
    }
    .into()
}
