use proc_macro::TokenStream;
use quote::quote;
use syn::{
    punctuated::Punctuated, token::Comma, ExprClosure, FnArg, Pat, PatType, Path, PathArguments,
    PathSegment, ReturnType, TypePath,
};

/// Run an async test as a one-test suite, with settings adjusted if needed.
///
/// The function takes a `TestScope` and may return `()` or a `Result`. It
/// becomes a `#[test]` that builds a Tokio runtime and runs a suite named
/// after the function, so resources the test asks for are cleaned up when
/// it finishes.
///
/// If other test macros are used, such as the [`parameterized`
/// crate](https://crates.io/crates/parameterized), the attributes for those
/// macros should be placed below the `testkit_test` macro. Additionally, the
/// settings closure can specify arguments that will be available on the
/// resulting function, for use by `parameterized`.
///
/// # Example:
///
/// Basic usage:
///
/// ```
/// use testkit::{testkit_test, TestScope};
///
/// #[testkit_test]
/// async fn test_function(scope: TestScope) {
///     assert_eq!(scope.name(), "test_function/test_function");
/// }
/// ```
///
/// Settings can be customized:
///
/// ```
/// use testkit::{testkit_test, TestScope};
///
/// #[testkit_test(|settings| settings.kafka.partitions = 3)]
/// async fn test_function(scope: TestScope) {
///     assert_eq!(scope.settings().kafka.partitions, 3);
/// }
/// ```
///
/// Other test macros, like `parameterized`, can be used:
///
/// ```
/// use testkit::{testkit_test, TestScope};
/// use parameterized::parameterized;
///
/// #[testkit_test(|settings, partitions: i32| settings.kafka.partitions = partitions)]
/// #[parameterized(partitions = { 1, 4 })]
/// async fn test(scope: TestScope) {
///     // test will run twice, once with each partition count.
///     assert_eq!(scope.settings().kafka.partitions, partitions);
/// }
/// ```
///
#[proc_macro_attribute]
pub fn testkit_test(attributes: TokenStream, item: TokenStream) -> TokenStream {
    // Parse the function that this macro is attached to.
    let mut input = syn::parse_macro_input!(item as syn::ItemFn);
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &mut input.sig;
    let body = &input.block;
    let test_name = sig.ident.to_string();

    // If the function doesn't have a #[test] attribute, we'll probably need to provide one.
    let has_test_attr = attrs.iter().any(|attr| attr.path.is_ident("test"));

    // Check for the library parameterized, which unconditionally adds
    // `#[test]`.
    let is_parameterized = attrs.iter().any(|attr| {
        let segment_names: Vec<_> = attr
            .path
            .segments
            .iter()
            .map(|segment| segment.ident.to_string())
            .collect();
        (segment_names == vec!["parameterized"])
            || (segment_names == vec!["parameterized", "parameterized"])
    });

    // If parameterized is not being used and there is no test attribute already
    // present, add one.
    let missing_test_attr = if has_test_attr || is_parameterized {
        quote!()
    } else {
        quote!(#[test])
    };

    // The outer function is sync and returns nothing, so take `async` and
    // the return type off the signature we reuse for it.
    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            sig.fn_token,
            "the async keyword is missing from the function declaration",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;
    let test_body = match std::mem::replace(&mut sig.output, ReturnType::Default) {
        ReturnType::Default => quote!(async move #body),
        ReturnType::Type(_, ty) => quote!(async move {
            let result: #ty = async move #body.await;
            result
        }),
    };

    // Find and take the `TestScope` arg, leaving any others in place. This
    // has the pattern match that defines the bindings the caller is expecting
    // to use, so we have to use it directly.
    let original_args = sig.inputs.clone();
    let mut toplevel_args = Punctuated::<FnArg, Comma>::new();
    let mut scope_arg = None;

    for arg in &original_args {
        match arg {
            syn::FnArg::Receiver(_) => toplevel_args.push(arg.clone()),
            syn::FnArg::Typed(PatType { ref ty, .. }) => match &**ty {
                syn::Type::Path(TypePath {
                    qself: None,
                    path: Path { segments, .. },
                }) => match segments.last() {
                    Some(PathSegment {
                        arguments: PathArguments::None,
                        ident,
                    }) if *ident == "TestScope" => {
                        scope_arg = Some(arg.clone());
                    }
                    _ => toplevel_args.push(arg.clone()),
                },
                _ => toplevel_args.push(arg.clone()),
            },
        }
    }

    let Some(scope_arg) = scope_arg else {
        return syn::Error::new_spanned(original_args, "expected an argument of type TestScope")
            .into_compile_error()
            .into();
    };

    // The settings closure in the macro invocation can also contribute
    // arguments. These arguments can be used by other macros like
    // parameterized.
    let settings_call =
        if attributes.is_empty() {
            quote!()
        } else {
            let settings_closure = syn::parse_macro_input!(attributes as ExprClosure);
            for arg in settings_closure.inputs {
                match arg {
                    Pat::Ident(pat) if pat.ident == "settings" => (),
                    Pat::Type(pat) => toplevel_args.push(FnArg::Typed(pat)),
                    _ => return syn::Error::new_spanned(
                        arg,
                        "only `val: Type` parameters can be used for testkit_test settings inputs",
                    )
                    .into_compile_error()
                    .into(),
                }
            }
            let closure_body = settings_closure.body;
            quote!(.settings(move |settings: &mut ::testkit::Settings| { #closure_body }))
        };

    // Add all collected arguments to the top level signature.
    sig.inputs = toplevel_args;

    // output the built test function

    (quote! {
        #(#attrs)*
        #missing_test_attr
        #vis #sig {
            ::testkit::__private::tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("Failed to build the test runtime")
                .block_on(async {
                    ::testkit::SuiteRunner::new(#test_name)
                        #settings_call
                        .filter(".*")
                        .test(#test_name, move |#scope_arg| #test_body)
                        .run()
                        .await
                        .expect("Failed to start the test suite")
                        .assert_success()
                })
        }
    })
    .into()
}
