#![allow(non_snake_case)]

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, spanned::Spanned};

/// Marks a struct as bound to at most one `Device` at a time.
///
/// Injects `pub(crate) device: crate::device::DeviceSlot` and implements the sealed
/// `crate::device::DeviceObject` trait for the struct. The slot starts empty; the
/// object's `init` fills it and its `shutdown` clears it.
#[proc_macro_attribute]
pub fn DeviceObject(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as syn::ItemStruct);
    let ident = input.ident.clone();
    let generics = input.generics.clone();
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut output_struct = input.clone();

    let syn::Fields::Named(fields_named) = &mut output_struct.fields else {
        return syn::Error::new(
            output_struct.span(),
            "DeviceObject only supports structs with named fields",
        )
        .to_compile_error()
        .into();
    };

    // Disallow existing `device` field to avoid ambiguity.
    if fields_named.named.iter().any(|f| f.ident.as_ref().is_some_and(|id| id == "device")) {
        return syn::Error::new(
            fields_named.span(),
            "DeviceObject: struct already has a `device` field; remove it and let the macro inject `pub(crate) device: DeviceSlot`",
        )
        .to_compile_error()
        .into();
    }

    let device_field: syn::Field = syn::parse_quote! {
        pub(crate) device: crate::device::DeviceSlot
    };
    fields_named.named.push(device_field);

    let expanded = quote! {
        #output_struct

        impl #impl_generics crate::device::sealed::Sealed for #ident #ty_generics #where_clause {}

        impl #impl_generics crate::device::DeviceObject for #ident #ty_generics #where_clause {
            #[inline]
            fn device_slot(&self) -> &crate::device::DeviceSlot { &self.device }
        }
    };

    expanded.into()
}
