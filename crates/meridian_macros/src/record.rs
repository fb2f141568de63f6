use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, GenericArgument, Ident, LitStr, PathArguments, Type};

struct Column {
    field: Ident,
    column_name: String,
    primitive: &'static str,
    nullable: bool,
}

struct ChildCollection {
    field: Ident,
    element_type: Type,
}

enum Classified {
    Column(Column),
    ChildCollection(ChildCollection),
}

pub fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    let struct_name = &input.ident;
    let table_name = table_name(&input)?;

    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(&input, "`Record` can only be derived for structs"));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new_spanned(&input, "`Record` requires named fields"));
    };

    let mut primary_key: Option<String> = None;
    let mut columns = Vec::new();
    let mut children = Vec::new();

    for field in &fields.named {
        let ident = field.ident.clone().expect("named field");
        let attrs = FieldAttrs::parse(field)?;

        match classify(&ident, &field.ty, &attrs)? {
            Classified::Column(col) => {
                if attrs.primary_key {
                    if let Some(prev) = &primary_key {
                        return Err(syn::Error::new_spanned(
                            field,
                            format!("only one field may be `#[meridian(primary_key)]` (already set on `{prev}`)"),
                        ));
                    }
                    primary_key = Some(col.field.to_string());
                }
                columns.push(col);
            }
            Classified::ChildCollection(child) => children.push(child),
        }
    }

    let raw_fields = columns.iter().map(|c| {
        let field_name = c.field.to_string();
        let column_name = &c.column_name;
        let primitive = format_ident!("{}", c.primitive);
        let nullable = c.nullable;
        quote! {
            meridian_core::RawField {
                field_name: #field_name,
                column_name: #column_name,
                primitive: meridian_core::PrimitiveType::#primitive,
                nullable: #nullable,
            }
        }
    });

    let child_descriptors = children.iter().map(|c| {
        let field_name = c.field.to_string();
        let element_type = &c.element_type;
        quote! {
            meridian_core::ChildCollectionDescriptor {
                field_name: #field_name,
                element_type: ::std::any::TypeId::of::<#element_type>(),
                element_type_name: ::std::any::type_name::<#element_type>(),
            }
        }
    });

    let explicit_pk = match &primary_key {
        Some(name) => quote! { Some(#name) },
        None => quote! { None },
    };

    let decode_fields = columns.iter().enumerate().map(|(idx, c)| decode_field(idx, c));
    let decode_field_names: Vec<&Ident> = columns.iter().map(|c| &c.field).collect();
    let child_defaults = children.iter().map(|c| {
        let field = &c.field;
        quote! { #field: None }
    });

    let column_values = columns.iter().map(|c| {
        let field = &c.field;
        quote! { meridian_core::Value::from(self.#field.clone()) }
    });

    let struct_name_str = struct_name.to_string();
    let no_such_child_panic = format!("`{{}}` is not a child-collection field of `{struct_name_str}`");

    let set_child_collection = if children.is_empty() {
        quote! {
            fn set_child_collection(&mut self, field_name: &'static str, _items: ::std::boxed::Box<dyn ::std::any::Any>) {
                panic!(#no_such_child_panic, field_name);
            }
        }
    } else {
        let set_child_arms = children.iter().map(|c| {
            let field_name = c.field.to_string();
            let field = &c.field;
            let element_type = &c.element_type;
            quote! {
                #field_name => {
                    let items = items
                        .downcast::<::std::vec::Vec<#element_type>>()
                        .expect("child loader produced a type mismatched with the declared element type");
                    self.#field = Some(*items);
                }
            }
        });
        quote! {
            fn set_child_collection(&mut self, field_name: &'static str, items: ::std::boxed::Box<dyn ::std::any::Any>) {
                match field_name {
                    #(#set_child_arms)*
                    other => panic!(#no_such_child_panic, other),
                }
            }
        }
    };

    // Records with no child collections fall back to the trait's default
    // no-op `create_children`.
    let create_children = if children.is_empty() {
        quote! {}
    } else {
        let calls = children.iter().map(|c| {
            let element_type = &c.element_type;
            quote! {
                meridian_core::create_recursive::<#element_type>(db, policy, visited)?;
            }
        });
        quote! {
            fn create_children(
                db: &meridian_core::Database,
                policy: meridian_core::CreatePolicy,
                visited: &mut ::std::collections::HashSet<::std::any::TypeId>,
            ) -> meridian_core::Result<()> {
                #(#calls)*
                Ok(())
            }
        }
    };

    let expanded = quote! {
        impl meridian_core::Record for #struct_name {
            fn schema() -> ::std::sync::Arc<meridian_core::TableSchema> {
                meridian_core::cached_schema(::std::any::TypeId::of::<Self>(), || {
                    meridian_core::TableSchema::build(
                        #struct_name_str,
                        #table_name,
                        ::std::vec![ #(#raw_fields),* ],
                        #explicit_pk,
                        ::std::vec![ #(#child_descriptors),* ],
                    )
                })
                .unwrap_or_else(|e| panic!("{e}"))
            }

            fn decode_row(
                cursor: &dyn meridian_core::RowCursor,
                schema: &meridian_core::TableSchema,
            ) -> ::std::result::Result<Self, meridian_core::DecodeError> {
                let _ = schema;
                #(#decode_fields)*
                Ok(Self {
                    #(#decode_field_names: #decode_field_names,)*
                    #(#child_defaults,)*
                })
            }

            fn column_values(&self, schema: &meridian_core::TableSchema) -> ::std::vec::Vec<meridian_core::Value> {
                let _ = schema;
                ::std::vec![ #(#column_values),* ]
            }

            #set_child_collection

            #create_children
        }
    };

    Ok(expanded)
}

fn table_name(input: &DeriveInput) -> syn::Result<String> {
    for attr in &input.attrs {
        if !attr.path().is_ident("meridian") {
            continue;
        }
        let mut found = None;
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                let lit: LitStr = meta.value()?.parse()?;
                found = Some(lit.value());
                Ok(())
            } else {
                Err(meta.error("unsupported `meridian` struct attribute, expected `table`"))
            }
        })?;
        if let Some(name) = found {
            return Ok(name);
        }
    }
    Err(syn::Error::new_spanned(
        &input.ident,
        "`#[derive(Record)]` requires `#[meridian(table = \"...\")]`",
    ))
}

struct FieldAttrs {
    primary_key: bool,
    column: Option<String>,
}

impl FieldAttrs {
    fn parse(field: &syn::Field) -> syn::Result<Self> {
        let mut primary_key = false;
        let mut column = None;
        for attr in &field.attrs {
            if !attr.path().is_ident("meridian") {
                continue;
            }
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("primary_key") {
                    primary_key = true;
                    Ok(())
                } else if meta.path.is_ident("column") {
                    let lit: LitStr = meta.value()?.parse()?;
                    column = Some(lit.value());
                    Ok(())
                } else {
                    Err(meta.error("unsupported `meridian` field attribute, expected `primary_key` or `column`"))
                }
            })?;
        }
        Ok(FieldAttrs { primary_key, column })
    }
}

/// Unwraps `Option<T>` into `(T, true)`, or returns `(ty, false)` unchanged.
fn unwrap_option(ty: &Type) -> (&Type, bool) {
    if let Type::Path(path) = ty {
        if let Some(segment) = path.path.segments.last() {
            if segment.ident == "Option" {
                if let PathArguments::AngleBracketed(args) = &segment.arguments {
                    if let Some(GenericArgument::Type(inner)) = args.args.first() {
                        return (inner, true);
                    }
                }
            }
        }
    }
    (ty, false)
}

/// Returns the element type of `Vec<T>`, if `ty` is shaped that way.
fn unwrap_vec(ty: &Type) -> Option<&Type> {
    if let Type::Path(path) = ty {
        if let Some(segment) = path.path.segments.last() {
            if segment.ident == "Vec" {
                if let PathArguments::AngleBracketed(args) = &segment.arguments {
                    if let Some(GenericArgument::Type(inner)) = args.args.first() {
                        return Some(inner);
                    }
                }
            }
        }
    }
    None
}

fn leaf_ident(ty: &Type) -> Option<String> {
    match ty {
        Type::Path(path) => path.path.segments.last().map(|s| s.ident.to_string()),
        _ => None,
    }
}

/// Maps a leaf Rust type to its `PrimitiveType` variant name, or `None` if
/// `ty` is not one of the closed set of supported primitives.
fn primitive_for(ty: &Type) -> Option<&'static str> {
    if let Some(inner) = unwrap_vec(ty) {
        return match leaf_ident(inner).as_deref() {
            Some("u8") => Some("Bytes"),
            _ => None,
        };
    }
    match leaf_ident(ty).as_deref() {
        Some("i8") => Some("I8"),
        Some("i16") => Some("I16"),
        Some("i32") => Some("I32"),
        Some("i64") => Some("I64"),
        Some("u8") => Some("U8"),
        Some("u16") => Some("U16"),
        Some("u32") => Some("U32"),
        Some("u64") => Some("U64"),
        Some("f32") => Some("F32"),
        Some("f64") => Some("F64"),
        Some("bool") => Some("Bool"),
        Some("String") => Some("Text"),
        Some("DateTime") => Some("Date"),
        Some("Uuid") => Some("Uuid"),
        _ => None,
    }
}

fn classify(ident: &Ident, ty: &Type, attrs: &FieldAttrs) -> syn::Result<Classified> {
    let (inner, nullable) = unwrap_option(ty);

    if primitive_for(inner).is_none() {
        if let Some(element_type) = unwrap_vec(inner) {
            if nullable {
                return Ok(Classified::ChildCollection(ChildCollection {
                    field: ident.clone(),
                    element_type: element_type.clone(),
                }));
            }
            return Err(syn::Error::new_spanned(
                ty,
                "a child-collection field must be `Option<Vec<_>>`, not a bare `Vec<_>`",
            ));
        }
    }

    let primitive = primitive_for(inner).ok_or_else(|| {
        syn::Error::new_spanned(ty, "field type is not a supported column primitive or `Option<Vec<_>>` child collection")
    })?;

    Ok(Classified::Column(Column {
        field: ident.clone(),
        column_name: attrs.column.clone().unwrap_or_else(|| ident.to_string()),
        primitive,
        nullable,
    }))
}

/// Generates a `let #field = ...;` binding that reads column `idx`,
/// unwraps the matching `Value` variant, and maps `Value::Null` to either
/// `None` (nullable) or `DecodeError::UnexpectedNull` (required).
fn decode_field(idx: usize, col: &Column) -> TokenStream {
    let field = &col.field;
    let column_name = &col.column_name;
    let primitive = format_ident!("{}", col.primitive);
    let value_variant = primitive.clone();
    let primitive_name = col.primitive;

    if col.nullable {
        quote! {
            let #field = match cursor.read_column(#idx, meridian_core::PrimitiveType::#primitive)? {
                meridian_core::Value::Null => None,
                meridian_core::Value::#value_variant(v) => Some(v),
                other => {
                    return Err(meridian_core::DecodeError::TypeMismatch {
                        column: #column_name,
                        expected: #primitive_name,
                        actual: other.shape_name(),
                    });
                }
            };
        }
    } else {
        quote! {
            let #field = match cursor.read_column(#idx, meridian_core::PrimitiveType::#primitive)? {
                meridian_core::Value::Null => {
                    return Err(meridian_core::DecodeError::UnexpectedNull { column: #column_name });
                }
                meridian_core::Value::#value_variant(v) => v,
                other => {
                    return Err(meridian_core::DecodeError::TypeMismatch {
                        column: #column_name,
                        expected: #primitive_name,
                        actual: other.shape_name(),
                    });
                }
            };
        }
    }
}
