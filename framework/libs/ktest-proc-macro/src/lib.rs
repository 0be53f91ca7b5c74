//! Attribute macros for the in-kernel test harness.
//!
//! `#[ktest]` registers a `fn() -> ()` in the `.ktest_array` link section so
//! the boot-time runner can find it. `#[if_cfg_ktest]` compiles a test module
//! only when the `ktest` cfg is passed (`RUSTFLAGS="--cfg ktest"`).

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Ident, ItemFn, ItemMod};

#[proc_macro_attribute]
pub fn if_cfg_ktest(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemMod);

    let output = quote! {
        #[cfg(ktest)]
        #input
    };

    TokenStream::from(output)
}

#[proc_macro_attribute]
pub fn ktest(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    assert!(
        input.sig.inputs.is_empty(),
        "a ktest function takes no arguments"
    );
    assert!(
        matches!(input.sig.output, syn::ReturnType::Default),
        "a ktest function returns `()`"
    );

    let fn_name = &input.sig.ident;
    let item_name = Ident::new(
        &format!("__ktest_item_{}", fn_name),
        proc_macro2::Span::call_site(),
    );

    let output = quote! {
        #input

        #[cfg(ktest)]
        #[used]
        #[link_section = ".ktest_array"]
        static #item_name: ktest::KtestItem = ktest::KtestItem::new(
            #fn_name,
            concat!(module_path!(), "::", stringify!(#fn_name)),
        );
    };

    TokenStream::from(output)
}
