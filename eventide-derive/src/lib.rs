//! A derive macro for the `Event` trait in the `eventide` crate.
use proc_macro::TokenStream;
use quote::quote;
use syn::{DeriveInput, LitStr, parse_macro_input};

/// Derives the `Event` trait for a struct or enum.
///
/// The logical event name defaults to the type's identifier. Use
/// `#[event(name = "...")]` to map several versioned types onto one name.
#[proc_macro_derive(Event, attributes(event))]
pub fn event_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let mut event_name = LitStr::new(&name.to_string(), name.span());
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("event")) {
        let parsed = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                event_name = meta.value()?.parse()?;
                Ok(())
            } else {
                Err(meta.error("unsupported event attribute, expected `name`"))
            }
        });
        if let Err(err) = parsed {
            return err.to_compile_error().into();
        }
    }

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let expanded = quote! {
        impl #impl_generics eventide::Event for #name #ty_generics #where_clause {
            const EVENT_NAME: &'static str = #event_name;
        }
    };

    TokenStream::from(expanded)
}
