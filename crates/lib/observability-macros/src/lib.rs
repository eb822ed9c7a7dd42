//! `#[obs]` marks a function for span instrumentation.
//!
//! The attribute expands to `tracing::instrument` behind the calling crate's
//! `observability` feature, so uninstrumented builds carry no span overhead.
//! Arguments are forwarded to `instrument`; with none, all arguments are skipped
//! and the span is named after the function.

use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

#[proc_macro_attribute]
pub fn obs(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item = parse_macro_input!(input as ItemFn);
    let name = item.sig.ident.to_string();
    let attr = if args.is_empty() {
        syn::parse_quote!(
            #[cfg_attr(feature = "observability", tracing::instrument(name = #name, skip_all))]
        )
    } else {
        let args = proc_macro2::TokenStream::from(args);
        syn::parse_quote!(#[cfg_attr(feature = "observability", tracing::instrument(#args))])
    };
    item.attrs.push(attr);
    TokenStream::from(quote!(#item))
}
