use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, ReturnType, parse_macro_input};

/// Runs `fn main` on a strand runtime.
///
/// The body becomes the first task of a `strand::Runtime` built from the configuration (after
/// `STRAND_*` environment overrides); the entry thread waits for it and keeps interception
/// off. `main` may return a value, such as a `Result`.
#[proc_macro_attribute]
pub fn main(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let name = &input.sig.ident;
    let body = &input.block;
    let attrs = &input.attrs;
    let vis = &input.vis;
    let output = &input.sig.output;

    if input.sig.asyncness.is_some() {
        return quote! { compile_error!("The #[strand::main] function must not be async"); }.into();
    }

    if name != "main" {
        return quote! {
            compile_error!("#[strand::main] can only be applied to the 'main' function");
        }
        .into();
    }

    let task = match output {
        ReturnType::Default => quote! { move || #body },
        ReturnType::Type(_, ty) => quote! { move || -> #ty #body },
    };

    let result = quote! {
        #(#attrs)*
        #vis fn main() #output {
            ::strand::runtime::init_logging();
            ::strand::config::apply_env()
                .expect("strand: invalid STRAND_* environment configuration");

            let runtime = ::strand::runtime::Runtime::new()
                .expect("strand: failed to initialize runtime");

            // The program only continues once the body has run to completion on a fiber.
            let output = runtime.block_on(#task);
            runtime.shutdown();
            output
        }
    };
    result.into()
}
