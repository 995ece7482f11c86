use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// Runs an `async fn main` as a fiber on a runtime configured from the environment.
#[proc_macro_attribute]
pub fn main(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let name = &input.sig.ident;
    let body = &input.block;
    let attrs = &input.attrs;
    let vis = &input.vis;

    // Ensure the function is async
    if input.sig.asyncness.is_none() {
        return quote! { compile_error!("The #[fibra::main] function must be async"); }.into();
    }

    if name != "main" {
        return quote! {
            compile_error!("#[fibra::main] can only be applied to the 'main' function");
        }
        .into();
    }

    if !input.sig.inputs.is_empty() {
        return quote! {
            compile_error!("#[fibra::main] function cannot take arguments");
        }
        .into();
    }

    let result = quote! {
        #(#attrs)*
        #vis fn main() {
            // 1. Bootstrap the runtime from FIBRA_* settings
            let config = ::fibra::RuntimeConfig::from_env()
                .expect("Invalid fibra runtime configuration");
            let runtime = ::fibra::Runtime::new(config)
                .expect("Failed to initialize runtime");

            // 2. Run the user's main body as a fiber and wait for it
            runtime
                .block_on(async move #body)
                .expect("main fiber failed");

            // Dropping the runtime stops and joins every worker.
        }
    };
    result.into()
}
