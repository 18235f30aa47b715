//! Derive macros for extracting typed structs out of an [`expresso`](https://docs.rs/expresso)
//! [`Context`](https://docs.rs/expresso/latest/expresso/context/struct.Context.html)'s route
//! parameters and query string without hand-writing the field-by-field parsing.

use proc_macro::TokenStream;
use syn::{Data, DeriveInput, Fields};

/// Derives `FromParams` for a struct with named fields, pulling each field out of the
/// route's `:name` captures (see `expresso::router::Params`) and parsing it via `FromStr`.
///
/// ```rust,ignore
/// use expresso::extract::FromParams;
/// use expresso_macros::FromParams;
///
/// #[derive(FromParams)]
/// struct UserParams {
///     id: u64,
/// }
/// ```
#[proc_macro_derive(FromParams)]
pub fn from_params_derive(input: TokenStream) -> TokenStream {
    derive_field_extractor(
        input,
        "FromParams",
        "expresso::extract::FromParams",
        "from_params",
        "expresso::router::Params",
        "Missing route parameter",
    )
}

/// Derives `FromQuery` for a struct with named fields, pulling each field out of the
/// request's parsed query string and parsing it via `FromStr`.
#[proc_macro_derive(FromQuery)]
pub fn from_query_derive(input: TokenStream) -> TokenStream {
    derive_field_extractor(
        input,
        "FromQuery",
        "expresso::extract::FromQuery",
        "from_query",
        "expresso::context::request::Query",
        "Missing query parameter",
    )
}

fn derive_field_extractor(
    input: TokenStream,
    derive_name: &str,
    trait_path: &str,
    method_name: &str,
    source_path: &str,
    missing_message: &str,
) -> TokenStream {
    let ast = syn::parse_macro_input!(input as DeriveInput);
    let struct_name = &ast.ident;

    let fields = match &ast.data {
        Data::Struct(s) => match &s.fields {
            Fields::Named(named) => &named.named,
            _ => {
                return syn::Error::new_spanned(
                    struct_name,
                    format!("{derive_name} can only be derived for structs with named fields"),
                )
                .to_compile_error()
                .into();
            }
        },
        _ => {
            return syn::Error::new_spanned(
                struct_name,
                format!("{derive_name} can only be derived for structs"),
            )
            .to_compile_error()
            .into();
        }
    };

    let trait_path: syn::Path = syn::parse_str(trait_path).unwrap();
    let source_path: syn::Path = syn::parse_str(source_path).unwrap();
    let method_ident = syn::Ident::new(method_name, proc_macro2::Span::call_site());

    let assigns = fields.iter().filter_map(|f| {
        f.ident.as_ref().map(|ident| {
            let ident_str = ident.to_string();
            quote::quote! {
                let #ident = source.get(#ident_str)
                    .ok_or_else(|| format!("{}: {}", #missing_message, #ident_str))?
                    .parse()
                    .map_err(|e| format!("failed to parse field '{}': {}", #ident_str, e))?;
            }
        })
    });

    let field_names = fields.iter().filter_map(|f| f.ident.as_ref());

    let expanded = quote::quote! {
        impl #trait_path for #struct_name {
            fn #method_ident(source: &#source_path) -> Result<Self, String> {
                #(#assigns)*
                Ok(Self { #(#field_names,)* })
            }
        }
    };

    TokenStream::from(expanded)
}
