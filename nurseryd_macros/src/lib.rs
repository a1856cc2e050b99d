use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

/// Derive for partial-update payloads.
///
/// Every `Option<_>` field is treated as a column of the same name. The derive
/// generates `changed_fields()`, listing the fields that carry a value, and
/// `push_assignments()`, which appends `col = ?` pairs with bound values to a
/// `sqlx::QueryBuilder<Sqlite>` and returns how many were pushed.
#[proc_macro_derive(ChangedFields)]
pub fn changed_fields(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let struct_name = input.ident;

    let fields = if let syn::Data::Struct(syn::DataStruct {
                                              fields: syn::Fields::Named(ref fields),
                                              ..
                                          }) = input.data {
        fields
    } else {
        panic!("Only named struct fields are supported");
    };

    let option_fields = fields.named.iter().filter_map(|field| {
        let field_name = field.ident.as_ref()?;
        if let syn::Type::Path(type_path) = &field.ty {
            if type_path.path.segments.last()?.ident == "Option" {
                return Some(field_name.clone());
            }
        }
        None
    }).collect::<Vec<_>>();

    let checks = option_fields.iter().map(|field_name| {
        quote! {
            if self.#field_name.is_some() {
                fields.push(stringify!(#field_name));
            }
        }
    });

    let assignments = option_fields.iter().map(|field_name| {
        quote! {
            if let Some(value) = &self.#field_name {
                if count > 0 {
                    builder.push(", ");
                }
                builder.push(concat!(stringify!(#field_name), " = "));
                builder.push_bind(value.clone());
                count += 1;
            }
        }
    });

    let expanded = quote! {
        impl #struct_name {
            pub fn changed_fields(&self) -> Vec<&'static str> {
                let mut fields = Vec::new();
                #(#checks)*
                fields
            }
            pub fn push_assignments<'args>(&self, builder: &mut sqlx::QueryBuilder<'args, sqlx::Sqlite>) -> usize {
                let mut count = 0usize;
                #(#assignments)*
                count
            }
        }
    };

    TokenStream::from(expanded)
}
