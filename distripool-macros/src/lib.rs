use proc_macro::TokenStream;
use proc_macro_error::{abort, proc_macro_error};
use quote::{format_ident, quote};
use syn::{
    parse_macro_input, punctuated::Punctuated, FnArg, ItemFn, Lit, Meta, Pat, PatType, ReturnType,
    Token, Type,
};

const NAME: &str = "name";

/// Returns true when the function's return type is spelled `...::Result<..>`
fn returns_result(output: &ReturnType) -> bool {
    match output {
        ReturnType::Type(_, ty) => match ty.as_ref() {
            Type::Path(tp) => tp
                .path
                .segments
                .last()
                .map(|seg| seg.ident == "Result")
                .unwrap_or(false),
            _ => false,
        },
        ReturnType::Default => false,
    }
}

/// Register a plain function as a remote callable.
///
/// Arguments are decoded from the positional JSON values of a packet with
/// serde, and the return value is encoded back to JSON. A function returning
/// `Result` has its error reported to the caller as a user error.
///
/// ```ignore
/// #[remote_fn]
/// fn square(x: i64) -> i64 {
///     x * x
/// }
///
/// #[remote_fn(name = "checked_div")]
/// fn div(a: i64, b: i64) -> anyhow::Result<i64> {
///     anyhow::ensure!(b != 0, "division by zero");
///     Ok(a / b)
/// }
/// ```
#[proc_macro_attribute]
#[proc_macro_error]
pub fn remote_fn(attr: TokenStream, item: TokenStream) -> TokenStream {
    let attr_args =
        syn::parse::Parser::parse2(Punctuated::<Meta, Token![,]>::parse_terminated, attr.into())
            .unwrap_or_else(|e| abort!(e.span(), "Failed to parse remote_fn attributes: {}", e));

    let input = parse_macro_input!(item as ItemFn);
    let fn_name = &input.sig.ident;

    let mut registered_name = fn_name.to_string();
    for meta in &attr_args {
        match meta {
            Meta::NameValue(nv) if nv.path.is_ident(NAME) => {
                if let syn::Expr::Lit(expr_lit) = &nv.value {
                    if let Lit::Str(lit) = &expr_lit.lit {
                        registered_name = lit.value();
                    } else {
                        abort!(expr_lit, "Expected a string literal for name");
                    }
                } else {
                    abort!(nv.value, "Expected a string literal for name");
                }
            }
            other => abort!(other, "Unknown remote_fn attribute; expected `name = \"...\"`"),
        }
    }

    if input.sig.asyncness.is_some() {
        abort!(input.sig.asyncness, "remote functions must be synchronous");
    }
    if !input.sig.generics.params.is_empty() {
        abort!(input.sig.generics, "remote functions cannot be generic");
    }

    let mut params = Vec::new();
    for arg in &input.sig.inputs {
        match arg {
            FnArg::Typed(PatType { pat, ty, .. }) => match pat.as_ref() {
                Pat::Ident(pat_ident) => {
                    params.push((pat_ident.ident.clone(), ty.as_ref().clone()))
                }
                other => abort!(other, "remote function parameters must be plain identifiers"),
            },
            FnArg::Receiver(receiver) => abort!(receiver, "remote functions cannot take self"),
        }
    }

    let arity = params.len();
    let struct_name = format_ident!("__{}RemoteFn", fn_name);
    let module_name = format_ident!("__remote_fn_{}", fn_name);
    let decode = params.iter().map(|(ident, ty)| {
        let param = ident.to_string();
        quote! {
            let #ident: #ty = ::distripool::executor::functions::decode_arg(
                #registered_name,
                #param,
                args.next(),
            )?;
        }
    });
    let arg_idents = params.iter().map(|(ident, _)| ident);
    let invoke = if returns_result(&input.sig.output) {
        quote! { super::#fn_name(#(#arg_idents),*)? }
    } else {
        quote! { super::#fn_name(#(#arg_idents),*) }
    };

    let expanded = quote! {
        #input

        #[doc(hidden)]
        #[allow(non_snake_case)]
        mod #module_name {
            #[allow(unused_imports)]
            use super::*;

            #[allow(non_camel_case_types)]
            pub struct #struct_name;

            impl ::distripool::executor::functions::RemoteFn for #struct_name {
                fn name(&self) -> &str {
                    #registered_name
                }

                fn call(
                    &self,
                    args: ::std::vec::Vec<::distripool::__private::Value>,
                ) -> ::distripool::__private::anyhow::Result<::distripool::__private::Value> {
                    ::distripool::executor::functions::check_arity(#registered_name, &args, #arity)?;
                    #[allow(unused_mut, unused_variables)]
                    let mut args = args.into_iter();
                    #(#decode)*
                    let output = #invoke;
                    ::distripool::executor::functions::encode_output(#registered_name, output)
                }
            }

            #[::distripool::linkme::distributed_slice(::distripool::executor::functions::REMOTE_FNS)]
            #[linkme(crate = ::distripool::linkme)]
            static REGISTRATION: fn() -> ::std::sync::Arc<dyn ::distripool::executor::functions::RemoteFn> =
                __register;

            fn __register() -> ::std::sync::Arc<dyn ::distripool::executor::functions::RemoteFn> {
                ::std::sync::Arc::new(#struct_name)
            }
        }
    };

    TokenStream::from(expanded)
}
