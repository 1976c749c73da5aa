use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use xml_content_model::{
    Cli, ConfigManager, ContentModelManager, DocumentationRequest, ElementDeclaration,
    ReferencedGrammarInfo, ResolveOptions, XmlDocument, uri,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);
    cli.validate().map_err(anyhow::Error::msg)?;

    let config = ConfigManager::load_config(&cli)
        .await
        .context("Failed to load configuration")?;
    let manager =
        ContentModelManager::from_config(&config).context("Failed to set up grammar resolution")?;

    let path = std::fs::canonicalize(&cli.file)
        .with_context(|| format!("Cannot access {}", cli.file.display()))?;
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Cannot read {}", path.display()))?;
    let document_uri = uri::from_file_path(&path);
    let document = XmlDocument::parse(document_uri.as_deref(), text)
        .with_context(|| format!("Cannot parse {}", path.display()))?;

    let infos = manager.referenced_grammar_infos(&document).await;
    if infos.is_empty() {
        println!("No grammar bound to {}", path.display());
        return Ok(());
    }
    println!("Grammars:");
    for info in &infos {
        print_grammar(info);
    }

    let Some((root, element)) = document
        .root_element()
        .and_then(|id| Some((id, document.element(id)?)))
    else {
        return Ok(());
    };
    let namespace = element.namespace_uri.clone();
    let options = ResolveOptions::waiting(ConfigManager::get_download_wait(&config));
    match manager
        .find_declaration(&document, root, namespace.as_deref(), &options)
        .await
    {
        Some(declaration) => print_declaration(&declaration),
        None => println!(
            "\nNo declaration for root element <{}>",
            element.qualified_name()
        ),
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_grammar(info: &ReferencedGrammarInfo) {
    let binding = info
        .identifier
        .as_ref()
        .map(|identifier| format!("{:?}", identifier.binding))
        .unwrap_or_else(|| "none".to_string());
    println!(
        "  {} (resolved by {}, binding {})",
        info.resolved_uri, info.resolution, binding
    );
    if let Some(cache) = &info.cache_info {
        if let Some(path) = &cache.cached_path {
            println!("    cache: {}", path.display());
        }
        if cache.downloading {
            println!("    downloading");
        }
        if cache.download_disabled {
            println!("    download disabled");
        }
        if let Some(error) = &cache.error {
            println!("    error: {}", error);
        }
    }
}

fn print_declaration(declaration: &ElementDeclaration) {
    let grammar = declaration.document().uri().unwrap_or("internal subset");
    println!("\n<{}> declared in {}", declaration.local_name(), grammar);
    if let Some(documentation) = declaration.documentation(&DocumentationRequest::plain_text()) {
        println!("  {}", documentation.replace('\n', "\n  "));
    }

    let children = declaration.elements();
    let required = declaration.required_elements();
    if !children.is_empty() {
        println!("Children:");
        for child in &children {
            let marker = if required.contains(child) { "required" } else { "optional" };
            println!("  {} ({})", child.local_name(), marker);
        }
    }

    let attributes = declaration.attributes();
    if !attributes.is_empty() {
        println!("Attributes:");
        for attribute in &attributes {
            let mut line = format!("  {}", attribute.local_name());
            if attribute.is_required() {
                line.push_str(" (required)");
            }
            if let Some(default) = attribute.default_value() {
                line.push_str(&format!(" default={default}"));
            }
            if !attribute.enumeration_values().is_empty() {
                line.push_str(&format!(" [{}]", attribute.enumeration_values().join("|")));
            }
            println!("{line}");
        }
    }
}
