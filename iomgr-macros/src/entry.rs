use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::parse::Parser;
use syn::spanned::Spanned;

use crate::parse::*;

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

/// Config used when the attribute arguments are invalid, so the expansion
/// still type checks and IDEs keep working.
const DEFAULT_ERROR_CONFIG: FinalConfig = FinalConfig {
    engine: EngineKind::Epoll,
    max_pollers: None,
};

/// Expands
///
/// ```ignore
/// #[iomgr::test(engine = "poll")]
/// fn works(engine: &iomgr::Engine) -> anyhow::Result<()> { ... }
/// ```
///
/// into a `#[test]` function that builds the engine, runs the original body
/// as an inner function, shuts the engine down and returns the body's result.
pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: syn::ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if let Some(attr) = input.attrs.iter().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args))
    };

    match config {
        Ok(config) => expand(input, config),
        Err(e) => token_stream_with_error(expand(input, DEFAULT_ERROR_CONFIG), e),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum EngineKind {
    Epoll,
    Poll,
    Env,
}

impl EngineKind {
    fn from_str(s: &str) -> Result<EngineKind, String> {
        match s {
            "epoll" => Ok(EngineKind::Epoll),
            "poll" => Ok(EngineKind::Poll),
            "env" => Ok(EngineKind::Env),
            _ => Err(format!(
                "No such engine `{s}`. The engines are `epoll`, `poll` and `env`."
            )),
        }
    }
}

struct FinalConfig {
    engine: EngineKind,
    max_pollers: Option<usize>,
}

#[derive(Default)]
struct ConfigBuilder {
    engine: Option<EngineKind>,
    max_pollers: Option<(usize, Span)>,
}

impl ConfigBuilder {
    fn set_engine(&mut self, lit: syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.engine.is_some() {
            return Err(syn::Error::new(span, "`engine` set multiple times."));
        }

        let name = parse_string(lit, span, "engine")?;
        let engine = EngineKind::from_str(&name).map_err(|err| syn::Error::new(span, err))?;
        self.engine = Some(engine);
        Ok(())
    }

    fn set_max_pollers(&mut self, lit: syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.max_pollers.is_some() {
            return Err(syn::Error::new(span, "`max_pollers` set multiple times."));
        }

        let max_pollers = parse_int(lit, span, "max_pollers")?;
        if max_pollers == 0 {
            return Err(syn::Error::new(span, "`max_pollers` may not be 0."));
        }
        self.max_pollers = Some((max_pollers, span));
        Ok(())
    }

    fn build(&self) -> Result<FinalConfig, syn::Error> {
        let engine = self.engine.unwrap_or(EngineKind::Epoll);

        let max_pollers = match (engine, self.max_pollers) {
            (EngineKind::Poll, Some((_, span))) => {
                let msg = "The `max_pollers` option requires the epoll engine. Use `#[iomgr::test(engine = \"epoll\")]`";
                return Err(syn::Error::new(span, msg));
            }
            (_, max_pollers) => max_pollers.map(|(n, _)| n),
        };

        Ok(FinalConfig {
            engine,
            max_pollers,
        })
    }
}

fn build_config(input: &syn::ItemFn, args: AttributeArgs) -> Result<FinalConfig, syn::Error> {
    if let Some(asyncness) = &input.sig.asyncness {
        let msg = "iomgr tests are synchronous: remove the `async` keyword";
        return Err(syn::Error::new_spanned(asyncness, msg));
    }
    if input.sig.inputs.len() > 1 {
        let msg = "the test function takes at most one argument: `&iomgr::Engine`";
        return Err(syn::Error::new_spanned(&input.sig.inputs, msg));
    }

    let mut config = ConfigBuilder::default();

    for arg in args {
        match arg {
            syn::Meta::NameValue(namevalue) => {
                let ident = namevalue
                    .path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&namevalue, "Must have specified ident"))?
                    .to_string()
                    .to_lowercase();
                let lit = match &namevalue.value {
                    syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                    expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
                };
                match ident.as_str() {
                    "engine" => config.set_engine(lit.clone(), lit.span())?,
                    "max_pollers" => config.set_max_pollers(lit.clone(), lit.span())?,
                    name => {
                        let msg = format!(
                            "Unknown attribute {name} is specified; expected one of: `engine`, `max_pollers`",
                        );
                        return Err(syn::Error::new_spanned(namevalue, msg));
                    }
                }
            }
            syn::Meta::Path(path) => {
                let name = path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&path, "Must have specified ident"))?
                    .to_string();
                let msg = match name.as_str() {
                    "epoll" | "poll" | "env" => {
                        format!("Set the engine with #[iomgr::test(engine = \"{name}\")].")
                    }
                    "engine" | "max_pollers" => format!("The `{name}` attribute requires an argument."),
                    name => format!(
                        "Unknown attribute {name} is specified; expected one of: `engine`, `max_pollers`."
                    ),
                };
                return Err(syn::Error::new_spanned(path, msg));
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "Unknown attribute inside the macro",
                ));
            }
        }
    }

    config.build()
}

fn expand(input: syn::ItemFn, config: FinalConfig) -> TokenStream {
    let syn::ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;

    // Type mismatches are reported against the body.
    let span = block.span();

    let mut builder = match config.engine {
        EngineKind::Epoll => quote_spanned! {span=> iomgr::runtime::Builder::new_epoll() },
        EngineKind::Poll => quote_spanned! {span=> iomgr::runtime::Builder::new_poll() },
        EngineKind::Env => quote_spanned! {span=>
            iomgr::runtime::Builder::from_env().expect("Invalid IOMGR_POLL_STRATEGY")
        },
    };
    if let Some(n) = config.max_pollers {
        builder = quote_spanned! {span=> #builder.max_pollers_per_island(#n) };
    }

    let name = &sig.ident;
    let output = &sig.output;
    let inputs = &sig.inputs;
    let call = if inputs.is_empty() {
        quote! { body() }
    } else {
        quote! { body(&engine) }
    };

    let mut outer = sig.clone();
    outer.inputs = syn::punctuated::Punctuated::new();

    quote! {
        #(#attrs)*
        #[::core::prelude::v1::test]
        #vis #outer {
            #[allow(clippy::needless_pass_by_value)]
            fn body(#inputs) #output #block

            #[allow(clippy::expect_used)]
            let engine = #builder
                .try_build()
                .expect(concat!("Failed building the engine for ", stringify!(#name)));
            let result = #call;
            engine.shutdown();
            result
        }
    }
}
