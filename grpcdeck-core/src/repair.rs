//! In-place repair of malformed file descriptor protos.
//!
//! Real-world reflection servers ship descriptors with three recurring
//! defects: type references without the matching `dependency` entry,
//! map-entry messages whose synthetic name does not follow the
//! `CamelCase(field) + "Entry"` convention, and reserved ranges where
//! `end <= start`. Each pass rewrites one defect and reports whether it
//! changed anything, so the assembler can decide when to retry a build.
//!
//! Repair operates purely on in-memory protos and performs no I/O.
//! Repair failures are never propagated; an unresolvable reference is
//! simply left alone.

use prost_types::{DescriptorProto, FieldDescriptorProto, FileDescriptorProto};

use crate::registry::CombinedResolver;

/// Run all three repair passes over one file. Returns whether any pass
/// changed the proto.
pub fn repair_file(fdp: &mut FileDescriptorProto, resolver: &CombinedResolver<'_>) -> bool {
    let imports = fix_missing_imports(fdp, resolver);
    let entries = fix_map_entry_names(fdp);
    let ranges = fix_reserved_ranges(fdp);
    imports || entries || ranges
}

/// Pass A: append a `dependency` entry for every type reference that
/// resolves against the combined resolver but whose enclosing file is not
/// yet declared. Existing dependencies are never removed.
pub fn fix_missing_imports(
    fdp: &mut FileDescriptorProto,
    resolver: &CombinedResolver<'_>,
) -> bool {
    let mut references = Vec::new();
    for message in &fdp.message_type {
        collect_message_references(message, &mut references);
    }
    for extension in &fdp.extension {
        collect_extension_references(extension, &mut references);
    }
    for service in &fdp.service {
        for method in &service.method {
            if let Some(input) = &method.input_type {
                references.push(input.clone());
            }
            if let Some(output) = &method.output_type {
                references.push(output.clone());
            }
        }
    }

    let package = fdp.package.clone().unwrap_or_default();
    let own_path = fdp.name.clone().unwrap_or_default();
    let mut changed = false;

    for reference in references {
        let name = reference.trim_start_matches('.');
        if name.is_empty() {
            continue;
        }
        let Some(enclosing) = resolve_scoped(name, &package, resolver) else {
            continue;
        };
        if enclosing == own_path {
            continue;
        }
        if !fdp.dependency.iter().any(|dep| dep == &enclosing) {
            fdp.dependency.push(enclosing);
            changed = true;
        }
    }

    changed
}

fn collect_message_references(message: &DescriptorProto, references: &mut Vec<String>) {
    for field in &message.field {
        if let Some(type_name) = &field.type_name {
            if !type_name.is_empty() {
                references.push(type_name.clone());
            }
        }
    }
    for extension in &message.extension {
        collect_extension_references(extension, references);
    }
    for nested in &message.nested_type {
        collect_message_references(nested, references);
    }
}

fn collect_extension_references(extension: &FieldDescriptorProto, references: &mut Vec<String>) {
    if let Some(type_name) = &extension.type_name {
        if !type_name.is_empty() {
            references.push(type_name.clone());
        }
    }
    if let Some(extendee) = &extension.extendee {
        if !extendee.is_empty() {
            references.push(extendee.clone());
        }
    }
}

/// Resolve a reference the way protoc scopes names: the name as written,
/// then qualified by the file's package with trailing segments stripped one
/// at a time (`r`, `a.b.c.r`, `a.b.r`, `a.r`).
fn resolve_scoped(
    name: &str,
    package: &str,
    resolver: &CombinedResolver<'_>,
) -> Option<String> {
    if let Some(path) = resolver.file_containing_symbol(name) {
        return Some(path);
    }
    let mut segments: Vec<&str> = package.split('.').filter(|s| !s.is_empty()).collect();
    while !segments.is_empty() {
        let candidate = format!("{}.{}", segments.join("."), name);
        if let Some(path) = resolver.file_containing_symbol(&candidate) {
            return Some(path);
        }
        segments.pop();
    }
    None
}

/// Pass B: rename mis-named map-entry messages to
/// `CamelCase(field_name) + "Entry"` and rewrite the owning field's
/// `type_name`, preserving whichever reference form it used.
pub fn fix_map_entry_names(fdp: &mut FileDescriptorProto) -> bool {
    let mut changed = false;
    for message in &mut fdp.message_type {
        changed |= fix_map_entries_in(message);
    }
    changed
}

fn fix_map_entries_in(message: &mut DescriptorProto) -> bool {
    if is_map_entry(message) {
        return false;
    }

    // (field index, nested index, expected entry name)
    let mut renames = Vec::new();
    for (field_index, field) in message.field.iter().enumerate() {
        let Some(type_name) = field.type_name.as_deref() else {
            continue;
        };
        if type_name.is_empty() {
            continue;
        }
        let referenced = type_name.rsplit('.').next().unwrap_or(type_name);
        let Some(nested_index) = message
            .nested_type
            .iter()
            .position(|nested| is_map_entry(nested) && nested.name.as_deref() == Some(referenced))
        else {
            continue;
        };
        let expected = format!(
            "{}Entry",
            camel_case(field.name.as_deref().unwrap_or_default())
        );
        if message.nested_type[nested_index].name.as_deref() == Some(expected.as_str()) {
            continue;
        }
        renames.push((field_index, nested_index, expected));
    }

    let mut changed = !renames.is_empty();
    for (field_index, nested_index, expected) in renames {
        message.nested_type[nested_index].name = Some(expected.clone());
        let field = &mut message.field[field_index];
        if let Some(type_name) = field.type_name.take() {
            field.type_name = Some(rewrite_last_segment(&type_name, &expected));
        }
    }

    for nested in &mut message.nested_type {
        if !is_map_entry(nested) {
            changed |= fix_map_entries_in(nested);
        }
    }
    changed
}

/// Replace the final dotted segment of a type reference, keeping the
/// absolute (`.pkg.Parent.Name`), suffix-relative (`Parent.Name`), or bare
/// (`Name`) form intact.
fn rewrite_last_segment(type_name: &str, new_last: &str) -> String {
    match type_name.rsplit_once('.') {
        Some((prefix, _)) => format!("{prefix}.{new_last}"),
        None => new_last.to_string(),
    }
}

/// protoc's field-name-to-message-name convention: drop underscores and
/// uppercase the first letter plus each letter that followed an underscore.
fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = true;
    for ch in name.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Pass C: reserved ranges are half-open `[start, end)`; some servers emit
/// `end == start`. Widen every degenerate range to cover its start.
pub fn fix_reserved_ranges(fdp: &mut FileDescriptorProto) -> bool {
    let mut changed = false;
    for message in &mut fdp.message_type {
        changed |= fix_ranges_in(message);
    }
    changed
}

fn fix_ranges_in(message: &mut DescriptorProto) -> bool {
    let mut changed = false;
    for range in &mut message.reserved_range {
        let Some(start) = range.start else { continue };
        if range.end.unwrap_or(start) <= start {
            range.end = Some(start + 1);
            changed = true;
        }
    }
    for nested in &mut message.nested_type {
        if !is_map_entry(nested) {
            changed |= fix_ranges_in(nested);
        }
    }
    changed
}

fn is_map_entry(message: &DescriptorProto) -> bool {
    message
        .options
        .as_ref()
        .and_then(|options| options.map_entry)
        .unwrap_or(false)
}
